// src/bootstrap.rs
//! Startup orchestration
//!
//! The order matters and is fixed:
//!
//! 1. Core validation rules (the registrar-contract guard)
//! 2. Core services and commands
//! 3. The running binary is recorded as a process module
//! 4. The licensed extension is probed
//! 5. The replace permission is set, once
//! 6. Extensions are discovered and registered
//! 7. The extension report is registered
//! 8. The catalog is sealed into the container

use crate::commands;
use crate::config::NougatConfig;
use crate::error::Result;
use crate::extensions::{
    DiscoveredExtension, EntryPoints, ExtensionDiscovery, ExtensionInfo, ExtensionReport,
};
use crate::loader::{AssemblyCache, LoadedModule, ResolutionHook, TrustedLoader, PRIMARY_MODULE};
use crate::registry::{
    Catalog, CommandContext, Origin, Registrar, RegistryError, ServiceContainer, ValidationRule,
    REGISTRAR_CONTRACT,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Extra core registrations (install, upgrade, ... live outside this crate)
pub type CoreModule = fn(&Registrar<'_>) -> std::result::Result<(), RegistryError>;

/// Rejects extension types that implement the registrar contract
pub fn registrar_guard() -> ValidationRule {
    ValidationRule::new("registrar-guard", |candidate| {
        !(candidate.origin.is_extension() && candidate.implements(REGISTRAR_CONTRACT))
    })
}

pub struct Bootstrap {
    config: NougatConfig,
    cache: Arc<AssemblyCache>,
    entry_points: EntryPoints,
    core_modules: Vec<CoreModule>,
}

impl Bootstrap {
    pub fn new(config: NougatConfig) -> Self {
        Self {
            config,
            cache: Arc::new(AssemblyCache::new()),
            entry_points: EntryPoints::new(),
            core_modules: Vec::new(),
        }
    }

    /// Read the configuration from `path` (or the default location) first
    pub fn from_config_file(path: Option<&Path>) -> Result<Self> {
        let config = NougatConfig::load(path)?;
        Ok(Self::new(config))
    }

    /// Look for extensions in `dir` instead of the configured directory
    pub fn with_extensions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config = self.config.with_extensions_dir(dir);
        self
    }

    /// Use an existing cache instead of a fresh one
    pub fn with_cache(mut self, cache: Arc<AssemblyCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_entry_points(mut self, entry_points: EntryPoints) -> Self {
        self.entry_points = entry_points;
        self
    }

    pub fn with_core_module(mut self, module: CoreModule) -> Self {
        self.core_modules.push(module);
        self
    }

    pub fn run(self) -> Result<Application> {
        let Self {
            config,
            cache,
            entry_points,
            core_modules,
        } = self;

        let catalog = Catalog::new();
        catalog.register_validator(registrar_guard())?;

        let core = catalog.registrar(Origin::Core);
        commands::register_core(&core)?;
        for module in &core_modules {
            module(&core)?;
        }
        debug!("Registered {} core command name(s)", catalog.command_names().len());

        if !cache.contains(PRIMARY_MODULE) {
            cache.register_process_module(LoadedModule::process(
                PRIMARY_MODULE,
                Some(config.trust.vendor_key.clone()),
            ))?;
        }

        let loader = Arc::new(TrustedLoader::new(Arc::clone(&cache)));
        let hook = ResolutionHook::new(
            Arc::clone(&loader),
            config.trust.vendor_key.clone(),
            config.extensions_dir.clone(),
            config.install_dir.clone(),
        );
        let discovery = ExtensionDiscovery::new(Arc::clone(&loader), entry_points).with_hook(hook);

        let licensed = discovery.probe_licensed(&config)?;
        let licensed_present = matches!(licensed, Some(DiscoveredExtension::Loaded(_)));
        let replace_permission = config.allow_replacing_registrations || licensed_present;
        catalog.set_replace_permission(replace_permission)?;

        let mut discovered: Vec<DiscoveredExtension> = licensed.into_iter().collect();
        discovered.extend(discovery.discover(&config)?);
        let extensions = discovery.register(&catalog, &config, discovered)?;

        let report = ExtensionReport::new(extensions.clone());
        core.register_factory::<ExtensionReport, _>(move |_| Ok(Arc::new(report.clone())))?;

        let mut builder = ServiceContainer::builder();
        catalog.seal(&mut builder)?;
        let container = builder.build();

        info!(
            "Startup complete: {} command(s), {} extension(s) registered",
            container.commands().count(),
            extensions.iter().filter(|e| e.is_registered()).count()
        );

        Ok(Application {
            container,
            config,
            extensions,
            loader,
            replace_permission,
        })
    }
}

/// The sealed application
pub struct Application {
    container: ServiceContainer,
    config: NougatConfig,
    extensions: Vec<ExtensionInfo>,
    loader: Arc<TrustedLoader>,
    replace_permission: bool,
}

impl Application {
    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    pub fn config(&self) -> &NougatConfig {
        &self.config
    }

    pub fn extensions(&self) -> &[ExtensionInfo] {
        &self.extensions
    }

    pub fn loader(&self) -> &Arc<TrustedLoader> {
        &self.loader
    }

    /// Whether replacing registrations was allowed during startup
    pub fn replace_permission(&self) -> bool {
        self.replace_permission
    }

    /// Run the command registered under `name`
    pub fn run_command(&self, name: &str, args: &[String]) -> anyhow::Result<()> {
        let command = self.container.instantiate_command(name)?;
        let ctx = CommandContext {
            invoked_as: name,
            args,
            container: &self.container,
            config: &self.config,
        };
        command.run(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> NougatConfig {
        let mut config = NougatConfig::default().with_extensions_dir(temp.path().join("extensions"));
        config.install_dir = None;
        config
    }

    #[test]
    fn test_bootstrap_without_extensions() {
        let temp = TempDir::new().unwrap();
        let app = Bootstrap::new(config(&temp)).run().unwrap();

        let help = app.container().command("commands").unwrap();
        assert_eq!(help.primary_name(), "help");
        assert_eq!(help.origin(), &Origin::Core);
        assert!(app.container().command("ext").is_some());
        assert!(app.extensions().is_empty());

        let report = app.container().resolve::<ExtensionReport>().unwrap();
        assert!(!report.is_licensed());
        assert!(app.loader().cache().contains("nougatlib"));
    }

    #[test]
    fn test_registrar_guard() {
        use crate::registry::ImplementationInfo;
        use std::any::TypeId;

        let guard = registrar_guard();
        let mut info = ImplementationInfo {
            type_id: TypeId::of::<u8>(),
            type_name: "Escalator",
            contracts: &[REGISTRAR_CONTRACT],
            origin: Origin::extension("evil"),
        };
        assert!(!guard.allows(&info));
        info.origin = Origin::Core;
        assert!(guard.allows(&info));
    }

    #[test]
    fn test_sources_listed_in_order() {
        let temp = TempDir::new().unwrap();
        let app = Bootstrap::new(config(&temp)).run().unwrap();
        let runners = app
            .container()
            .resolve_all::<dyn commands::SourceRunner>()
            .unwrap();
        assert_eq!(runners[0].source_type(), "nuget");
        assert!(app.run_command("source-types", &[]).is_ok());
    }

    #[test]
    fn test_bad_config_file_is_a_fatal_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "allow_unsigned_extensions = \"sometimes\"").unwrap();

        let err = Bootstrap::from_config_file(Some(&path)).err().unwrap();
        assert!(matches!(err, crate::Error::Config(_)));
        assert!(err.is_fatal());

        std::fs::write(&path, "allow_unsigned_extensions = true").unwrap();
        let app = Bootstrap::from_config_file(Some(&path))
            .unwrap()
            .with_extensions_dir(temp.path().join("extensions"))
            .run()
            .unwrap();
        assert!(app.config().allow_unsigned_extensions);
    }
}
