//! The hash ledger written next to a backup.
//!
//! `hashes.dat` is a flat run of 128-byte records, each the hex digest of a
//! relative path followed by the hex digest of that file's content. There is
//! no header; the record count is the file size divided by 128.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::digest::{Digest, HEX_LEN};
use crate::{IransError, IransResult};

/// File name of the ledger inside a backup directory.
pub const MANIFEST_FILE: &str = "hashes.dat";

/// Bytes per ledger record.
pub const RECORD_LEN: usize = 2 * HEX_LEN;

/// Outcome of checking one restored file against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch { expected: Digest, actual: Digest },
    Missing,
}

/// Map from path digest to content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: HashMap<Digest, Digest>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file. A later insert for the same path replaces the earlier.
    pub fn insert(&mut self, path: Digest, content: Digest) {
        self.entries.insert(path, content);
    }

    /// Merge every record of `other` into `self`.
    pub fn extend(&mut self, other: Manifest) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, path: &Digest) -> Option<&Digest> {
        self.entries.get(path)
    }

    pub fn verify(&self, path: &Digest, actual: Digest) -> Verdict {
        match self.entries.get(path) {
            None => Verdict::Missing,
            Some(&expected) if expected == actual => Verdict::Match,
            Some(&expected) => Verdict::Mismatch { expected, actual },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the on-disk record format. Records are sorted by path
    /// digest so the output is deterministic.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut records: Vec<(&Digest, &Digest)> = self.entries.iter().collect();
        records.sort();
        let mut out = Vec::with_capacity(records.len() * RECORD_LEN);
        for (path, content) in records {
            out.extend_from_slice(path.to_hex().as_bytes());
            out.extend_from_slice(content.to_hex().as_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> IransResult<Self> {
        if bytes.len() % RECORD_LEN != 0 {
            return Err(IransError::CorruptManifest(format!(
                "size {} is not a multiple of {RECORD_LEN}",
                bytes.len()
            )));
        }
        let mut manifest = Manifest::new();
        for (i, record) in bytes.chunks_exact(RECORD_LEN).enumerate() {
            let (path, content) = record.split_at(HEX_LEN);
            let parse = |hex: &[u8]| {
                Digest::from_hex(hex).ok_or_else(|| {
                    IransError::CorruptManifest(format!("record {i} is not a hex digest pair"))
                })
            };
            manifest.insert(parse(path)?, parse(content)?);
        }
        Ok(manifest)
    }

    pub fn write(&self, path: &Path) -> IransResult<()> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn read(path: &Path) -> IransResult<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::hash_bytes;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.insert(hash_bytes(b"a/x.bin"), hash_bytes(b"0123456789"));
        manifest.insert(hash_bytes(b"a/b/y.bin"), hash_bytes(b""));
        manifest
    }

    #[test]
    fn test_record_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), 2 * RECORD_LEN);
        assert!(bytes.iter().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_parse_written_ledger() {
        let manifest = sample();
        assert_eq!(Manifest::from_bytes(&manifest.to_bytes()).unwrap(), manifest);
        assert!(Manifest::from_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_bad_size_is_corrupt() {
        let mut bytes = sample().to_bytes();
        bytes.pop();
        assert!(matches!(
            Manifest::from_bytes(&bytes),
            Err(IransError::CorruptManifest(_))
        ));
    }

    #[test]
    fn test_non_hex_record_is_corrupt() {
        let mut bytes = sample().to_bytes();
        bytes[5] = b'z';
        assert!(matches!(
            Manifest::from_bytes(&bytes),
            Err(IransError::CorruptManifest(_))
        ));
    }

    #[test]
    fn test_verify() {
        let manifest = sample();
        let path = hash_bytes(b"a/x.bin");
        assert_eq!(manifest.verify(&path, hash_bytes(b"0123456789")), Verdict::Match);
        assert!(matches!(
            manifest.verify(&path, hash_bytes(b"0123456788")),
            Verdict::Mismatch { .. }
        ));
        assert_eq!(
            manifest.verify(&hash_bytes(b"c.bin"), hash_bytes(b"")),
            Verdict::Missing
        );
    }

    #[test]
    fn test_extend_merges_records() {
        let mut a = Manifest::new();
        a.insert(hash_bytes(b"1"), hash_bytes(b"one"));
        let mut b = Manifest::new();
        b.insert(hash_bytes(b"2"), hash_bytes(b"two"));
        a.extend(b);
        assert_eq!(a.len(), 2);
    }
}
