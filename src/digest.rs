//! BLAKE3 digests in the fixed-width hex form stored by the manifest.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::IransResult;

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Length of a digest rendered as lowercase hex.
pub const HEX_LEN: usize = DIGEST_LEN * 2;

const READ_BUFFER: usize = 1 << 20;

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex, [`HEX_LEN`] bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse [`HEX_LEN`] hex digits. Returns `None` for anything else.
    pub fn from_hex(digits: &[u8]) -> Option<Self> {
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(digits, &mut bytes).ok()?;
        Some(Digest(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

pub fn hash_bytes(data: &[u8]) -> Digest {
    Digest(*blake3::hash(data).as_bytes())
}

/// Hash a file's content with bounded memory.
pub fn hash_file(path: &Path) -> IransResult<Digest> {
    let reader = BufReader::with_capacity(READ_BUFFER, File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(reader)?;
    Ok(Digest(*hasher.finalize().as_bytes()))
}

/// Hash a relative path in its portable `/`-separated form.
pub fn hash_relative_path(relative: &Path) -> Digest {
    let portable: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    hash_bytes(portable.join("/").as_bytes())
}
