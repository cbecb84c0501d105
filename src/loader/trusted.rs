// src/loader/trusted.rs
//! Identity-checked module loading

use super::{
    module_file_name, AssemblyCache, KeyToken, LoadError, LoadGuard, LoadedModule, ModuleImage,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of searching a directory for one module
#[derive(Debug)]
pub enum Discovery {
    /// A candidate carried an accepted identity
    Found(Arc<LoadedModule>),
    /// Candidates exist but none was accepted; callers must not fall back
    Rejected { candidates: Vec<PathBuf> },
    /// No file with the module's name
    Absent,
}

impl Discovery {
    pub fn module(&self) -> Option<&Arc<LoadedModule>> {
        match self {
            Self::Found(module) => Some(module),
            _ => None,
        }
    }
}

/// Loads module images and publishes them in an [`AssemblyCache`]
pub struct TrustedLoader {
    cache: Arc<AssemblyCache>,
    disk_reads: AtomicU64,
}

impl TrustedLoader {
    pub fn new(cache: Arc<AssemblyCache>) -> Self {
        Self {
            cache,
            disk_reads: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<AssemblyCache> {
        &self.cache
    }

    /// How many module images have been read from disk
    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    /// Return the cached module for `name`, loading it from `path` otherwise
    ///
    /// A module whose identity is not `expected` yields `Ok(None)`.
    pub fn resolve_or_load(
        &self,
        name: &str,
        expected: Option<&KeyToken>,
        path: &Path,
    ) -> Result<Option<Arc<LoadedModule>>, LoadError> {
        if let Some(module) = self.cache.get(name) {
            return Ok(self.accept_cached(module, expected.map(std::slice::from_ref).unwrap_or(&[])));
        }

        let candidates: Vec<KeyToken> = expected.cloned().into_iter().collect();
        self.load(name, path, &candidates)
    }

    /// Load `name` from `path` if its identity is one of `candidates`
    ///
    /// An empty candidate list accepts any module, signed or not.
    pub fn load(
        &self,
        name: &str,
        path: &Path,
        candidates: &[KeyToken],
    ) -> Result<Option<Arc<LoadedModule>>, LoadError> {
        let guard = self.cache.acquire()?;

        // Another caller may have won the race while we waited
        if let Some(module) = self.cache.get(name) {
            return Ok(self.accept_cached(module, candidates));
        }

        self.load_locked(&guard, name, path, candidates)
    }

    /// Cached module for `name` with an accepted identity; never reads disk
    pub fn resolve_existing(&self, name: &str, candidates: &[KeyToken]) -> Option<Arc<LoadedModule>> {
        self.cache
            .get(name)
            .filter(|module| module.accepted_by(candidates))
    }

    /// Search `dir` for images named after `name` and load the first accepted one
    pub fn discover(
        &self,
        dir: &Path,
        name: &str,
        candidates: &[KeyToken],
    ) -> Result<Discovery, LoadError> {
        let paths = find_candidates(dir, name)?;
        if paths.is_empty() {
            debug!("No candidate for module {} in {}", name, dir.display());
            return Ok(Discovery::Absent);
        }

        for path in &paths {
            match self.load(name, path, candidates) {
                Ok(Some(module)) => return Ok(Discovery::Found(module)),
                Ok(None) => continue,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Skipping module candidate {}: {}", path.display(), e),
            }
        }

        warn!(
            "Module {} has {} candidate(s) in {} but none carries an accepted identity",
            name,
            paths.len(),
            dir.display()
        );
        Ok(Discovery::Rejected { candidates: paths })
    }

    fn accept_cached(
        &self,
        module: Arc<LoadedModule>,
        candidates: &[KeyToken],
    ) -> Option<Arc<LoadedModule>> {
        if module.accepted_by(candidates) {
            Some(module)
        } else {
            debug!(
                "Module {} is already loaded with identity {:?}; not the one requested",
                module.name(),
                module.identity().map(KeyToken::as_str)
            );
            None
        }
    }

    fn load_locked(
        &self,
        guard: &LoadGuard<'_>,
        name: &str,
        path: &Path,
        candidates: &[KeyToken],
    ) -> Result<Option<Arc<LoadedModule>>, LoadError> {
        let bytes = fs::read(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.disk_reads.fetch_add(1, Ordering::Relaxed);

        let image = ModuleImage::parse(&bytes).map_err(|source| LoadError::InvalidImage {
            path: path.to_path_buf(),
            source,
        })?;

        if !image.manifest().name.eq_ignore_ascii_case(name) {
            debug!(
                "{} declares module {}, not {}",
                path.display(),
                image.manifest().name,
                name
            );
            return Ok(None);
        }

        let module = LoadedModule::from_image(image, path);
        if !module.accepted_by(candidates) {
            debug!(
                "Discarding {}: identity {:?} is not among the accepted keys",
                path.display(),
                module.identity().map(KeyToken::as_str)
            );
            return Ok(None);
        }

        let module = Arc::new(module);
        self.cache.publish(guard, name, Arc::clone(&module));
        info!(
            "Loaded module {} from {} in {:?}",
            name,
            path.display(),
            guard.held_for()
        );
        Ok(Some(module))
    }
}

/// Image files named `<name>.ngm` at the top of `dir` or one level below
fn find_candidates(dir: &Path, name: &str) -> Result<Vec<PathBuf>, LoadError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let file_name = module_file_name(name);
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(2).sort_by_file_name() {
        let entry = entry.map_err(|e| LoadError::Scan {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.eq_ignore_ascii_case(&file_name))
        {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}
