// src/extensions/discovery.rs
//! Finding, loading and registering extensions

use super::{
    EntryPoints, ExtensionInfo, ExtensionStatus, LICENSED_EXTENSION,
};
use crate::config::NougatConfig;
use crate::loader::{
    Discovery, HookOutcome, KeyToken, LoadError, LoadedModule, ModuleHandle, ResolutionHook,
    TrustedLoader, MODULE_EXTENSION,
};
use crate::registry::{Catalog, Origin};
use anyhow::Context;
use glob::{MatchOptions, Pattern};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An extension found on disk, before registration
#[derive(Debug)]
pub enum DiscoveredExtension {
    Loaded(Arc<LoadedModule>),
    Disabled(String),
    Rejected { name: String, candidates: Vec<PathBuf> },
    /// The loader failed on this name; other extensions are unaffected
    Failed { name: String, reason: String },
}

impl DiscoveredExtension {
    pub fn name(&self) -> &str {
        match self {
            Self::Loaded(module) => module.name(),
            Self::Disabled(name) | Self::Rejected { name, .. } | Self::Failed { name, .. } => name,
        }
    }
}

pub struct ExtensionDiscovery {
    loader: Arc<TrustedLoader>,
    entry_points: EntryPoints,
    hook: Option<ResolutionHook>,
}

impl ExtensionDiscovery {
    pub fn new(loader: Arc<TrustedLoader>, entry_points: EntryPoints) -> Self {
        Self {
            loader,
            entry_points,
            hook: None,
        }
    }

    /// Use `hook` for module requirements that are not loaded yet
    pub fn with_hook(mut self, hook: ResolutionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn loader(&self) -> &Arc<TrustedLoader> {
        &self.loader
    }

    /// Extension names present in `dir`, sorted, case-insensitively unique
    ///
    /// Sub-directory names and the stems of top-level `*.ngm` files both
    /// count as candidates.
    pub fn candidate_names(dir: &Path) -> Result<Vec<String>, LoadError> {
        if !dir.is_dir() {
            debug!("Extensions directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }

        let scan_error = |e: std::io::Error| LoadError::Scan {
            path: dir.to_path_buf(),
            message: e.to_string(),
        };
        let pattern = Pattern::new(&format!("*.{}", MODULE_EXTENSION)).map_err(|e| {
            LoadError::Scan {
                path: dir.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };

        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(dir).map_err(scan_error)? {
            let entry = entry.map_err(scan_error)?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();

            let name = if path.is_dir() {
                Some(file_name)
            } else if pattern.matches_with(&file_name, options) {
                path.file_stem().map(|s| s.to_string_lossy().into_owned())
            } else {
                None
            };

            if let Some(name) = name {
                if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Look for the licensed extension; only the vendor key is accepted
    pub fn probe_licensed(
        &self,
        config: &NougatConfig,
    ) -> Result<Option<DiscoveredExtension>, LoadError> {
        if config.is_disabled(LICENSED_EXTENSION) {
            return Ok(Some(DiscoveredExtension::Disabled(LICENSED_EXTENSION.to_string())));
        }

        let vendor = std::slice::from_ref(&config.trust.vendor_key);
        let discovery = self
            .loader
            .discover(&config.extensions_dir, LICENSED_EXTENSION, vendor);
        Ok(match absorb(LICENSED_EXTENSION, discovery)? {
            Ok(Discovery::Found(module)) => {
                info!("Found licensed extension {}", module.name());
                Some(DiscoveredExtension::Loaded(module))
            }
            Ok(Discovery::Rejected { candidates }) => Some(DiscoveredExtension::Rejected {
                name: LICENSED_EXTENSION.to_string(),
                candidates,
            }),
            Ok(Discovery::Absent) => None,
            Err(reason) => Some(DiscoveredExtension::Failed {
                name: LICENSED_EXTENSION.to_string(),
                reason,
            }),
        })
    }

    /// Load every extension in the configured directory except the licensed one
    pub fn discover(&self, config: &NougatConfig) -> Result<Vec<DiscoveredExtension>, LoadError> {
        let dir = &config.extensions_dir;
        let identities = config.accepted_identities();
        let mut found = Vec::new();

        let names = match absorb("extensions directory", Self::candidate_names(dir))? {
            Ok(names) => names,
            Err(_) => return Ok(found),
        };

        for name in names {
            if name.eq_ignore_ascii_case(LICENSED_EXTENSION) {
                continue;
            }
            if config.is_disabled(&name) {
                debug!("Extension {} is disabled", name);
                found.push(DiscoveredExtension::Disabled(name));
                continue;
            }
            if let Some(existing) = self.loader.cache().get(&name) {
                if matches!(existing.handle(), ModuleHandle::Process) {
                    debug!("Skipping {}: part of the running process", name);
                    continue;
                }
            }

            match absorb(&name, self.loader.discover(dir, &name, &identities))? {
                Ok(Discovery::Found(module)) => found.push(DiscoveredExtension::Loaded(module)),
                Ok(Discovery::Rejected { candidates }) => {
                    found.push(DiscoveredExtension::Rejected { name, candidates })
                }
                // Candidate names come from the same directory listing
                Ok(Discovery::Absent) => {
                    debug!("Extension {} disappeared during discovery", name)
                }
                Err(reason) => found.push(DiscoveredExtension::Failed { name, reason }),
            }
        }
        Ok(found)
    }

    /// Register each discovered extension, in order
    ///
    /// A failing extension is reported and skipped, and none of its
    /// registrations are kept. Only a fatal loader error stops the loop.
    pub fn register(
        &self,
        catalog: &Catalog,
        config: &NougatConfig,
        discovered: Vec<DiscoveredExtension>,
    ) -> Result<Vec<ExtensionInfo>, LoadError> {
        let mut report = Vec::with_capacity(discovered.len());
        for extension in discovered {
            let info = match extension {
                DiscoveredExtension::Disabled(name) => {
                    ExtensionInfo::unloaded(&name, ExtensionStatus::Disabled, None)
                }
                DiscoveredExtension::Rejected { name, candidates } => {
                    warn!(
                        "Extension {} was not loaded: no trusted signature on {} candidate(s)",
                        name,
                        candidates.len()
                    );
                    ExtensionInfo::unloaded(
                        &name,
                        ExtensionStatus::Rejected,
                        Some("signature is not trusted".to_string()),
                    )
                }
                DiscoveredExtension::Failed { name, reason } => {
                    ExtensionInfo::unloaded(&name, ExtensionStatus::Failed, Some(reason))
                }
                DiscoveredExtension::Loaded(module) => {
                    self.register_module(catalog, config, &module)?
                }
            };
            report.push(info);
        }
        Ok(report)
    }

    fn register_module(
        &self,
        catalog: &Catalog,
        config: &NougatConfig,
        module: &LoadedModule,
    ) -> Result<ExtensionInfo, LoadError> {
        let name = module.name();
        let failed = |reason: String| {
            warn!("Extension {} failed to register: {}", name, reason);
            ExtensionInfo::for_module(module, ExtensionStatus::Failed, Some(reason))
        };

        if let Err(reason) = self.resolve_requirements(module)? {
            return Ok(failed(reason));
        }

        let symbol = module
            .manifest()
            .and_then(|m| m.entry_point.clone())
            .unwrap_or_else(|| name.to_string());
        let Some(entry) = self.entry_points.get(&symbol) else {
            return Ok(failed(format!("entry point '{}' is not available", symbol)));
        };

        // All or nothing: the extension registers into a private stage that
        // is committed only when its registration returns normally.
        let staged = catalog.stage();
        let registrar = staged.registrar(Origin::extension(name));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
            let extension = entry().with_context(|| format!("Failed to construct extension {}", name))?;
            extension.register_dependencies(&registrar, config)
        }));

        Ok(match outcome {
            Ok(Ok(())) => match catalog.commit(staged) {
                Ok(()) => {
                    info!("Registered extension {}", name);
                    ExtensionInfo::for_module(module, ExtensionStatus::Registered, None)
                }
                Err(e) => failed(e.to_string()),
            },
            Ok(Err(e)) => failed(format!("{:#}", e)),
            Err(payload) => failed(format!("panicked: {}", panic_message(payload.as_ref()))),
        })
    }

    /// Inner `Err` names the requirement that could not be satisfied
    fn resolve_requirements(&self, module: &LoadedModule) -> Result<Result<(), String>, LoadError> {
        let Some(manifest) = module.manifest() else {
            return Ok(Ok(()));
        };

        for request in &manifest.requires {
            let candidates: Vec<KeyToken> = request.identity.iter().cloned().collect();
            if self.loader.resolve_existing(&request.name, &candidates).is_some() {
                continue;
            }

            let outcome = match &self.hook {
                Some(hook) => match absorb(&request.name, hook.on_unresolved(request))? {
                    Ok(outcome) => outcome,
                    Err(reason) => {
                        return Ok(Err(format!(
                            "required module {} could not be resolved: {}",
                            request.name, reason
                        )))
                    }
                },
                None => HookOutcome::Unhandled,
            };
            match outcome {
                HookOutcome::Handled(found) => {
                    debug!("Resolved {} for {} via fallback", found.name(), module.name())
                }
                HookOutcome::Refused => {
                    return Ok(Err(format!(
                        "required module {} has no trusted candidate",
                        request.name
                    )))
                }
                HookOutcome::Unhandled => {
                    return Ok(Err(format!("required module {} not found", request.name)))
                }
            }
        }
        Ok(Ok(()))
    }
}

/// Split loader errors: fatal ones propagate, the rest become a reason
fn absorb<T>(subject: &str, result: Result<T, LoadError>) -> Result<Result<T, String>, LoadError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("Skipping {}: {}", subject, e);
            Ok(Err(e.to_string()))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::ExtensionModule;
    use crate::loader::{
        module_file_name, AssemblyCache, ModuleImage, ModuleManifest, ModuleRequest,
        SigningKeyPair, LEGACY_MODULE, PRIMARY_MODULE,
    };
    use crate::registry::{
        Command, CommandContext, Component, Registrar, Resolver,
    };
    use tempfile::TempDir;

    struct Hello;

    impl Component for Hello {
        fn construct(_: &Resolver<'_>) -> anyhow::Result<Self> {
            Ok(Hello)
        }
    }

    impl Command for Hello {
        fn names() -> &'static [&'static str] {
            &["hello", "hi"]
        }

        fn summary(&self) -> &str {
            "Say hello"
        }

        fn run(&self, _ctx: &CommandContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct HelloExtension;

    impl ExtensionModule for HelloExtension {
        fn register_dependencies(
            &self,
            registrar: &Registrar<'_>,
            _config: &NougatConfig,
        ) -> anyhow::Result<()> {
            registrar.register_command::<Hello>()?;
            Ok(())
        }
    }

    struct BrokenExtension;

    impl ExtensionModule for BrokenExtension {
        fn register_dependencies(
            &self,
            _registrar: &Registrar<'_>,
            _config: &NougatConfig,
        ) -> anyhow::Result<()> {
            anyhow::bail!("missing runtime")
        }
    }

    struct Greet;

    impl Component for Greet {
        fn construct(_: &Resolver<'_>) -> anyhow::Result<Self> {
            Ok(Greet)
        }
    }

    impl Command for Greet {
        fn names() -> &'static [&'static str] {
            &["greet", "g"]
        }

        fn summary(&self) -> &str {
            "Greet, core edition"
        }

        fn run(&self, _ctx: &CommandContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct LoudGreet;

    impl Component for LoudGreet {
        fn construct(_: &Resolver<'_>) -> anyhow::Result<Self> {
            Ok(LoudGreet)
        }
    }

    impl Command for LoudGreet {
        fn names() -> &'static [&'static str] {
            &["greet"]
        }

        fn summary(&self) -> &str {
            "Greet loudly"
        }

        fn run(&self, _ctx: &CommandContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Takes over a core command, adds one of its own, then fails
    struct HalfExtension;

    impl ExtensionModule for HalfExtension {
        fn register_dependencies(
            &self,
            registrar: &Registrar<'_>,
            _config: &NougatConfig,
        ) -> anyhow::Result<()> {
            registrar.register_command::<LoudGreet>()?;
            registrar.register_command::<Hello>()?;
            anyhow::bail!("runtime not available")
        }
    }

    fn half() -> anyhow::Result<Box<dyn ExtensionModule>> {
        Ok(Box::new(HalfExtension))
    }

    fn hello() -> anyhow::Result<Box<dyn ExtensionModule>> {
        Ok(Box::new(HelloExtension))
    }

    fn broken() -> anyhow::Result<Box<dyn ExtensionModule>> {
        Ok(Box::new(BrokenExtension))
    }

    fn panicking() -> anyhow::Result<Box<dyn ExtensionModule>> {
        panic!("constructor blew up")
    }

    struct Env {
        temp: TempDir,
        key: SigningKeyPair,
        config: NougatConfig,
        discovery: ExtensionDiscovery,
    }

    fn env() -> Env {
        let temp = TempDir::new().unwrap();
        let key = SigningKeyPair::generate();
        let mut config = NougatConfig::default().with_extensions_dir(temp.path());
        config.trust.vendor_key = key.key_token();
        config.install_dir = None;

        let loader = Arc::new(TrustedLoader::new(Arc::new(AssemblyCache::new())));
        let entry_points = EntryPoints::new()
            .with("hello_register", hello)
            .with("broken_register", broken)
            .with("panicking_register", panicking)
            .with("half_register", half);
        Env {
            temp,
            key,
            config,
            discovery: ExtensionDiscovery::new(loader, entry_points),
        }
    }

    fn install(env: &Env, name: &str, entry_point: &str, requires: &[ModuleRequest]) {
        let dir = env.temp.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        let mut manifest = ModuleManifest::new(name, "0.3.0", b"code").with_entry_point(entry_point);
        for request in requires {
            manifest = manifest.with_requirement(request.clone());
        }
        let bytes = ModuleImage::encode(&manifest, b"code", Some(&env.key)).unwrap();
        fs::write(dir.join(module_file_name(name)), bytes).unwrap();
    }

    fn run(env: &Env, catalog: &Catalog) -> Vec<ExtensionInfo> {
        let discovered = env.discovery.discover(&env.config).unwrap();
        env.discovery
            .register(catalog, &env.config, discovered)
            .unwrap()
    }

    #[test]
    fn test_candidate_names() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("alpha")).unwrap();
        fs::write(temp.path().join("beta.ngm"), b"").unwrap();
        fs::write(temp.path().join("ALPHA.NGM"), b"").unwrap();
        fs::write(temp.path().join("readme.txt"), b"").unwrap();

        let names = ExtensionDiscovery::candidate_names(temp.path()).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.eq_ignore_ascii_case("alpha")));
        assert!(names.contains(&"beta".to_string()));

        let missing = temp.path().join("missing");
        assert!(ExtensionDiscovery::candidate_names(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_failures_do_not_stop_discovery() {
        let env = env();
        install(&env, "broken", "broken_register", &[]);
        install(&env, "greeter", "hello_register", &[]);
        install(&env, "orphan", "orphan_register", &[]);
        install(&env, "panicky", "panicking_register", &[]);
        let catalog = Catalog::new();

        let report = run(&env, &catalog);
        let status = |name: &str| report.iter().find(|e| e.name == name).map(|e| e.status);

        assert_eq!(status("greeter"), Some(ExtensionStatus::Registered));
        assert_eq!(status("broken"), Some(ExtensionStatus::Failed));
        assert_eq!(status("orphan"), Some(ExtensionStatus::Failed));
        assert_eq!(status("panicky"), Some(ExtensionStatus::Failed));
        assert_eq!(
            catalog.command_owner("hi").map(|info| info.origin),
            Some(Origin::extension("greeter"))
        );

        let panicked = report.iter().find(|e| e.name == "panicky").unwrap();
        assert!(panicked.reason.as_deref().unwrap().contains("constructor blew up"));
    }

    #[test]
    fn test_disabled_extension_is_never_read() {
        let mut env = env();
        install(&env, "greeter", "hello_register", &[]);
        env.config.disabled_extensions = vec!["Greeter".to_string()];
        let catalog = Catalog::new();

        let report = run(&env, &catalog);
        assert_eq!(report[0].status, ExtensionStatus::Disabled);
        assert_eq!(env.discovery.loader().disk_reads(), 0);
        assert!(catalog.command_owner("hello").is_none());
    }

    #[test]
    fn test_untrusted_extension_is_rejected() {
        let mut env = env();
        install(&env, "greeter", "hello_register", &[]);
        env.config.trust.vendor_key = SigningKeyPair::generate().key_token();

        let report = run(&env, &Catalog::new());
        assert_eq!(report[0].status, ExtensionStatus::Rejected);
    }

    #[test]
    fn test_requirement_satisfied_by_process_module_alias() {
        let env = env();
        env.discovery
            .loader()
            .cache()
            .register_process_module(LoadedModule::process(
                PRIMARY_MODULE,
                Some(env.key.key_token()),
            ))
            .unwrap();
        install(
            &env,
            "greeter",
            "hello_register",
            &[ModuleRequest::new(LEGACY_MODULE, Some(env.key.key_token()))],
        );
        install(
            &env,
            "needy",
            "hello_register",
            &[ModuleRequest::new("nougat.runtime", Some(env.key.key_token()))],
        );

        let report = run(&env, &Catalog::new());
        let greeter = report.iter().find(|e| e.name == "greeter").unwrap();
        let needy = report.iter().find(|e| e.name == "needy").unwrap();
        assert_eq!(greeter.status, ExtensionStatus::Registered);
        assert_eq!(needy.status, ExtensionStatus::Failed);
    }

    #[test]
    fn test_licensed_requires_vendor_key() {
        let mut env = env();
        install(&env, LICENSED_EXTENSION, "hello_register", &[]);

        assert!(matches!(
            env.discovery.probe_licensed(&env.config).unwrap(),
            Some(DiscoveredExtension::Loaded(_))
        ));

        // A third-party key that is otherwise trusted is not enough
        let vendor = SigningKeyPair::generate().key_token();
        env.config.trust.trusted_keys = vec![env.key.key_token()];
        env.config.trust.vendor_key = vendor;
        let fresh = ExtensionDiscovery::new(
            Arc::new(TrustedLoader::new(Arc::new(AssemblyCache::new()))),
            EntryPoints::new(),
        );
        assert!(matches!(
            fresh.probe_licensed(&env.config).unwrap(),
            Some(DiscoveredExtension::Rejected { .. })
        ));
    }

    #[test]
    fn test_discover_skips_licensed() {
        let env = env();
        install(&env, LICENSED_EXTENSION, "hello_register", &[]);
        let discovered = env.discovery.discover(&env.config).unwrap();
        assert!(discovered.is_empty());
    }

    #[test]
    fn test_failed_extension_keeps_none_of_its_registrations() {
        let env = env();
        install(&env, "half", "half_register", &[]);
        let catalog = Catalog::new();
        catalog.registrar(Origin::Core).register_command::<Greet>().unwrap();

        let report = run(&env, &catalog);
        assert_eq!(report[0].status, ExtensionStatus::Failed);
        assert!(report[0].reason.as_deref().unwrap().contains("runtime not available"));

        assert!(catalog.command_owner("hello").is_none());
        assert_eq!(
            catalog.command_owner("greet").map(|info| info.origin),
            Some(Origin::Core)
        );
        assert_eq!(
            catalog.command_owner("g").map(|info| info.origin),
            Some(Origin::Core)
        );
    }

    #[test]
    fn test_non_fatal_load_errors_are_absorbed() {
        let scan = LoadError::Scan {
            path: PathBuf::from("/ext/locked"),
            message: "permission denied".to_string(),
        };
        let reason = absorb::<()>("locked", Err(scan)).unwrap().unwrap_err();
        assert!(reason.contains("permission denied"));

        let timeout = LoadError::LockTimeout(std::time::Duration::from_secs(5));
        assert!(matches!(
            absorb::<()>("locked", Err(timeout)),
            Err(LoadError::LockTimeout(_))
        ));
    }

    #[test]
    fn test_loader_failure_is_reported_per_extension() {
        let env = env();
        let discovered = vec![
            DiscoveredExtension::Failed {
                name: "locked".to_string(),
                reason: "Failed to scan extensions directory".to_string(),
            },
            DiscoveredExtension::Disabled("quiet".to_string()),
        ];

        let report = env
            .discovery
            .register(&Catalog::new(), &env.config, discovered)
            .unwrap();
        assert_eq!(report[0].status, ExtensionStatus::Failed);
        assert_eq!(report[1].status, ExtensionStatus::Disabled);
    }

    #[test]
    fn test_lock_timeout_still_aborts_discovery() {
        let env = env();
        install(&env, "greeter", "hello_register", &[]);
        let cache = Arc::new(AssemblyCache::with_lock_timeout(
            std::time::Duration::from_millis(20),
        ));
        let discovery = ExtensionDiscovery::new(
            Arc::new(TrustedLoader::new(Arc::clone(&cache))),
            EntryPoints::new(),
        );

        let _held = cache.acquire().unwrap();
        assert!(matches!(
            discovery.discover(&env.config),
            Err(LoadError::LockTimeout(_))
        ));
    }
}
