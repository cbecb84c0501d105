// src/loader/hook.rs
//! Fallback resolution for modules nothing else could find
//!
//! When a module requirement cannot be satisfied from the cache, the hook
//! gets one chance to find it. It only ever answers for one signing identity
//! (the vendor key); every other request is left [`HookOutcome::Unhandled`]
//! so the caller's default handling still applies.

use super::{Discovery, KeyToken, LoadError, LoadedModule, TrustedLoader};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// A module one module expects to find at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequest {
    pub name: String,
    #[serde(default, rename = "key_token", skip_serializing_if = "Option::is_none")]
    pub identity: Option<KeyToken>,
}

impl ModuleRequest {
    pub fn new(name: impl Into<String>, identity: Option<KeyToken>) -> Self {
        Self {
            name: name.into(),
            identity,
        }
    }
}

/// What the hook did with a request
#[derive(Debug)]
pub enum HookOutcome {
    Handled(Arc<LoadedModule>),
    /// Not ours to answer
    Unhandled,
    /// Candidates exist but none verified; do not fall back
    Refused,
}

pub struct ResolutionHook {
    loader: Arc<TrustedLoader>,
    identity: KeyToken,
    extensions_dir: PathBuf,
    install_dir: Option<PathBuf>,
}

struct Reentry;

impl Reentry {
    fn enter() -> Option<Self> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Reentry)
            }
        })
    }
}

impl Drop for Reentry {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

impl ResolutionHook {
    pub fn new(
        loader: Arc<TrustedLoader>,
        identity: KeyToken,
        extensions_dir: PathBuf,
        install_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            loader,
            identity,
            extensions_dir,
            install_dir,
        }
    }

    /// Try to satisfy `request`
    ///
    /// Order: already loaded modules, then the extensions directory, then
    /// the install directory. The install directory is consulted only when
    /// the extensions directory has no candidate at all.
    pub fn on_unresolved(&self, request: &ModuleRequest) -> Result<HookOutcome, LoadError> {
        if request.identity.as_ref() != Some(&self.identity) {
            return Ok(HookOutcome::Unhandled);
        }
        let Some(_reentry) = Reentry::enter() else {
            debug!("Re-entrant resolution of {} left to the caller", request.name);
            return Ok(HookOutcome::Unhandled);
        };

        let candidates = std::slice::from_ref(&self.identity);
        if let Some(module) = self.loader.resolve_existing(&request.name, candidates) {
            return Ok(HookOutcome::Handled(module));
        }

        match self
            .loader
            .discover(&self.extensions_dir, &request.name, candidates)?
        {
            Discovery::Found(module) => return Ok(HookOutcome::Handled(module)),
            Discovery::Rejected { candidates } => {
                warn!(
                    "Refusing to resolve {}: {} unverified candidate(s) in {}",
                    request.name,
                    candidates.len(),
                    self.extensions_dir.display()
                );
                return Ok(HookOutcome::Refused);
            }
            Discovery::Absent => {}
        }

        let Some(install_dir) = &self.install_dir else {
            return Ok(HookOutcome::Unhandled);
        };
        Ok(match self.loader.discover(install_dir, &request.name, candidates)? {
            Discovery::Found(module) => HookOutcome::Handled(module),
            Discovery::Rejected { .. } => HookOutcome::Refused,
            Discovery::Absent => HookOutcome::Unhandled,
        })
    }

    /// Run `f` as if already inside the hook on this thread
    #[cfg(test)]
    fn nested<R>(f: impl FnOnce() -> R) -> R {
        let _reentry = Reentry::enter();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{module_file_name, AssemblyCache, ModuleImage, ModuleManifest, SigningKeyPair};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_image(dir: &Path, name: &str, signer: &SigningKeyPair) {
        fs::create_dir_all(dir).unwrap();
        let manifest = ModuleManifest::new(name, "1.0.0", b"code");
        let bytes = ModuleImage::encode(&manifest, b"code", Some(signer)).unwrap();
        fs::write(dir.join(module_file_name(name)), bytes).unwrap();
    }

    struct Fixture {
        _temp: TempDir,
        vendor: SigningKeyPair,
        extensions: PathBuf,
        install: PathBuf,
        hook: ResolutionHook,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let vendor = SigningKeyPair::generate();
        let extensions = temp.path().join("extensions");
        let install = temp.path().join("lib");
        let loader = Arc::new(TrustedLoader::new(Arc::new(AssemblyCache::new())));
        let hook = ResolutionHook::new(
            loader,
            vendor.key_token(),
            extensions.clone(),
            Some(install.clone()),
        );
        Fixture {
            _temp: temp,
            vendor,
            extensions,
            install,
            hook,
        }
    }

    #[test]
    fn test_ignores_foreign_identity() {
        let f = fixture();
        let other = SigningKeyPair::generate();
        write_image(&f.extensions, "tools", &other);

        let request = ModuleRequest::new("tools", Some(other.key_token()));
        assert!(matches!(f.hook.on_unresolved(&request).unwrap(), HookOutcome::Unhandled));
        assert!(matches!(
            f.hook.on_unresolved(&ModuleRequest::new("tools", None)).unwrap(),
            HookOutcome::Unhandled
        ));
    }

    #[test]
    fn test_falls_back_to_install_dir_when_absent() {
        let f = fixture();
        write_image(&f.install, "tools", &f.vendor);

        let request = ModuleRequest::new("tools", Some(f.vendor.key_token()));
        match f.hook.on_unresolved(&request).unwrap() {
            HookOutcome::Handled(module) => assert_eq!(module.name(), "tools"),
            other => panic!("expected handled, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_candidate_suppresses_fallback() {
        let f = fixture();
        let impostor = SigningKeyPair::generate();
        write_image(&f.extensions, "tools", &impostor);
        write_image(&f.install, "tools", &f.vendor);

        let request = ModuleRequest::new("tools", Some(f.vendor.key_token()));
        assert!(matches!(f.hook.on_unresolved(&request).unwrap(), HookOutcome::Refused));
    }

    #[test]
    fn test_reentrant_call_is_unhandled() {
        let f = fixture();
        write_image(&f.extensions, "tools", &f.vendor);

        let request = ModuleRequest::new("tools", Some(f.vendor.key_token()));
        let nested = ResolutionHook::nested(|| f.hook.on_unresolved(&request).unwrap());
        assert!(matches!(nested, HookOutcome::Unhandled));
        assert!(matches!(f.hook.on_unresolved(&request).unwrap(), HookOutcome::Handled(_)));
    }
}
