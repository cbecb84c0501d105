// src/loader/cache.rs
//! Process-wide store of loaded modules
//!
//! Lookups are lock-free reads of a concurrent map. Writes happen only while
//! holding a [`LoadGuard`], which is the single load lock acquired with a
//! bounded wait.

use super::{cache_key, legacy_alias, LoadError, LoadedModule, DEFAULT_LOCK_TIMEOUT};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Proof that the load lock is held; released on drop
pub struct LoadGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    acquired_at: Instant,
}

impl LoadGuard<'_> {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Loaded modules keyed by lower-cased simple name
pub struct AssemblyCache {
    /// Modules loaded by the trusted loader
    entries: DashMap<String, Arc<LoadedModule>>,
    /// Modules that were part of the process before any load
    process: DashMap<String, Arc<LoadedModule>>,
    load_lock: Mutex<()>,
    lock_timeout: Duration,
}

impl AssemblyCache {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Cache with a custom bound on waiting for the load lock
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            process: DashMap::new(),
            load_lock: Mutex::new(()),
            lock_timeout,
        }
    }

    /// Take the load lock, failing with [`LoadError::LockTimeout`] after the bound
    pub fn acquire(&self) -> Result<LoadGuard<'_>, LoadError> {
        match self.load_lock.try_lock_for(self.lock_timeout) {
            Some(guard) => Ok(LoadGuard {
                _guard: guard,
                acquired_at: Instant::now(),
            }),
            None => {
                error!(
                    "Could not acquire the module load lock within {:?}",
                    self.lock_timeout
                );
                Err(LoadError::LockTimeout(self.lock_timeout))
            }
        }
    }

    /// Look a module up by name; never blocks on the load lock
    pub fn get(&self, name: &str) -> Option<Arc<LoadedModule>> {
        let key = cache_key(name);
        self.entries
            .get(&key)
            .or_else(|| self.process.get(&key))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Store a freshly loaded module under `name` (and its legacy alias)
    pub fn publish(&self, _guard: &LoadGuard<'_>, name: &str, module: Arc<LoadedModule>) {
        if let Some(alias) = legacy_alias(name) {
            debug!("Caching module {} under legacy alias {}", name, alias);
            self.entries.insert(alias.to_string(), Arc::clone(&module));
        }
        self.entries.insert(cache_key(name), module);
    }

    /// Record a module that is already present in the running process
    pub fn register_process_module(&self, module: LoadedModule) -> Result<Arc<LoadedModule>, LoadError> {
        let _guard = self.acquire()?;
        let name = module.name().to_string();
        let module = Arc::new(module);

        if let Some(alias) = legacy_alias(&name) {
            self.process.insert(alias.to_string(), Arc::clone(&module));
        }
        self.process.insert(cache_key(&name), Arc::clone(&module));
        debug!("Registered process module {}", name);
        Ok(module)
    }

    /// Number of distinct cached names, aliases included
    pub fn len(&self) -> usize {
        self.entries.len() + self.process.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AssemblyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{KeyToken, LEGACY_MODULE, PRIMARY_MODULE};

    #[test]
    fn test_process_module_visible_under_both_names() {
        let cache = AssemblyCache::new();
        let module = cache
            .register_process_module(LoadedModule::process(PRIMARY_MODULE, Some(KeyToken::vendor())))
            .unwrap();

        let by_legacy = cache.get(LEGACY_MODULE).unwrap();
        assert!(Arc::ptr_eq(&module, &by_legacy));
        assert!(cache.contains("NOUGAT"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_publish_requires_guard_and_is_case_insensitive() {
        let cache = AssemblyCache::new();
        {
            let guard = cache.acquire().unwrap();
            cache.publish(&guard, "Ext.Tools", Arc::new(LoadedModule::process("Ext.Tools", None)));
        }
        assert!(cache.contains("ext.tools"));
        assert!(!cache.contains("ext"));
    }

    #[test]
    fn test_acquire_times_out() {
        let cache = AssemblyCache::with_lock_timeout(Duration::from_millis(20));
        let _held = cache.acquire().unwrap();

        std::thread::scope(|scope| {
            let result = scope.spawn(|| cache.acquire().map(|_| ())).join().unwrap();
            match result {
                Err(LoadError::LockTimeout(waited)) => {
                    assert_eq!(waited, Duration::from_millis(20))
                }
                other => panic!("expected lock timeout, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_guard_released_on_drop() {
        let cache = AssemblyCache::with_lock_timeout(Duration::from_millis(20));
        drop(cache.acquire().unwrap());
        assert!(cache.acquire().is_ok());
    }
}
