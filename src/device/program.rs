//! Registry of device program sources and their compiled forms.
//!
//! Sources are registered by name; a program is compiled the first time it
//! is requested and the result is cached for the life of the cache. Each
//! device owns its own cache, so dropping a device drops its programs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{IransError, IransResult};

struct Programs<P> {
    sources: HashMap<String, String>,
    built: HashMap<String, Arc<P>>,
}

pub struct ProgramCache<P> {
    inner: Mutex<Programs<P>>,
}

impl<P> ProgramCache<P> {
    pub fn new() -> Self {
        ProgramCache {
            inner: Mutex::new(Programs {
                sources: HashMap::new(),
                built: HashMap::new(),
            }),
        }
    }

    /// Register `source` under `name`. Re-registering a name is a no-op.
    pub fn register(&self, name: &str, source: &str) {
        self.lock()
            .sources
            .entry(name.to_string())
            .or_insert_with(|| source.to_string());
    }

    /// Return the compiled program for `name`, building it with `build`
    /// on first use.
    ///
    /// Builds run under the cache lock, so concurrent callers never compile
    /// the same program twice. A failed build is not cached.
    pub fn get_or_build<F>(&self, name: &str, build: F) -> IransResult<Arc<P>>
    where
        F: FnOnce(&str) -> IransResult<P>,
    {
        let mut programs = self.lock();
        if let Some(program) = programs.built.get(name) {
            return Ok(Arc::clone(program));
        }
        let source = programs.sources.get(name).ok_or_else(|| {
            IransError::invalid(format!("failed to load unregistered program '{name}'"))
        })?;
        let program = Arc::new(build(source)?);
        programs.built.insert(name.to_string(), Arc::clone(&program));
        Ok(program)
    }

    #[cfg(test)]
    fn built_count(&self) -> usize {
        self.lock().built.len()
    }

    fn lock(&self) -> MutexGuard<'_, Programs<P>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_unregistered_program_is_invalid() {
        let cache: ProgramCache<String> = ProgramCache::new();
        let result = cache.get_or_build("freq_dist", |src| Ok(src.to_string()));
        assert!(matches!(result, Err(IransError::InvalidOperation(_))));
    }

    #[test]
    fn test_builds_once_and_caches() {
        let cache: ProgramCache<usize> = ProgramCache::new();
        cache.register("k", "kernel source");
        let builds = Cell::new(0);
        for _ in 0..3 {
            let program = cache
                .get_or_build("k", |src| {
                    builds.set(builds.get() + 1);
                    Ok(src.len())
                })
                .unwrap();
            assert_eq!(*program, 13);
        }
        assert_eq!(builds.get(), 1);
        assert_eq!(cache.built_count(), 1);
    }

    #[test]
    fn test_failed_build_not_cached() {
        let cache: ProgramCache<u32> = ProgramCache::new();
        cache.register("k", "src");
        let failed = cache.get_or_build("k", |_| {
            Err(IransError::Build {
                program: "k".into(),
                device: "test".into(),
            })
        });
        assert!(matches!(failed, Err(IransError::Build { .. })));
        assert_eq!(cache.built_count(), 0);
        assert_eq!(*cache.get_or_build("k", |_| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_register_keeps_first_source() {
        let cache: ProgramCache<String> = ProgramCache::new();
        cache.register("k", "first");
        cache.register("k", "second");
        let program = cache.get_or_build("k", |src| Ok(src.to_string())).unwrap();
        assert_eq!(program.as_str(), "first");
    }
}
