// src/extensions/mod.rs
//! Extension modules
//!
//! An extension ships as a signed module image in the extensions directory,
//! either at the top level (`<name>.ngm`) or in a sub-directory named after
//! it. The image names a registration entry point; the host links the code
//! behind each entry point and looks it up in an [`EntryPoints`] table. The
//! extension then registers services and commands through a [`Registrar`]
//! scoped to its own origin, exactly as core code does.
//!
//! The licensed extension ([`LICENSED_EXTENSION`]) is special: it is only
//! accepted when signed with the vendor key, it is registered before any
//! other extension, and its presence grants the replace permission.

mod discovery;

pub use discovery::{DiscoveredExtension, ExtensionDiscovery};

use crate::config::NougatConfig;
use crate::loader::{KeyToken, LoadedModule};
use crate::registry::Registrar;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

/// Name of the commercially licensed extension
pub const LICENSED_EXTENSION: &str = "nougat.licensed";

/// Contract every extension module implements
pub trait ExtensionModule: Send {
    /// Register this extension's services and commands
    fn register_dependencies(
        &self,
        registrar: &Registrar<'_>,
        config: &NougatConfig,
    ) -> anyhow::Result<()>;
}

/// Constructor exported under an entry point symbol
pub type EntryPoint = fn() -> anyhow::Result<Box<dyn ExtensionModule>>;

/// Entry point symbols linked into the host
#[derive(Clone, Default)]
pub struct EntryPoints {
    table: HashMap<String, EntryPoint>,
}

impl EntryPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, symbol: &str, entry: EntryPoint) -> Self {
        self.insert(symbol, entry);
        self
    }

    pub fn insert(&mut self, symbol: &str, entry: EntryPoint) {
        self.table.insert(symbol.to_string(), entry);
    }

    pub fn get(&self, symbol: &str) -> Option<EntryPoint> {
        self.table.get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut symbols: Vec<&str> = self.table.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        f.debug_struct("EntryPoints").field("symbols", &symbols).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExtensionStatus {
    /// Loaded and registered
    Registered,
    /// Listed in `disabled_extensions`; never loaded
    Disabled,
    /// Present on disk but no candidate carried an accepted identity
    Rejected,
    /// Loaded, but registration did not complete
    Failed,
}

/// What happened to one extension during startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionInfo {
    pub name: String,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    pub identity: Option<KeyToken>,
    pub status: ExtensionStatus,
    /// Why the extension is not registered
    pub reason: Option<String>,
}

impl ExtensionInfo {
    fn for_module(module: &LoadedModule, status: ExtensionStatus, reason: Option<String>) -> Self {
        Self {
            name: module.name().to_string(),
            version: module.manifest().map(|m| m.version.clone()),
            path: module.source().map(|p| p.to_path_buf()),
            identity: module.identity().cloned(),
            status,
            reason,
        }
    }

    fn unloaded(name: &str, status: ExtensionStatus, reason: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            path: None,
            identity: None,
            status,
            reason,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.status == ExtensionStatus::Registered
    }
}

/// Outcome of extension startup, resolvable from the container
#[derive(Debug, Clone, Default)]
pub struct ExtensionReport {
    extensions: Vec<ExtensionInfo>,
    licensed: bool,
}

impl ExtensionReport {
    pub fn new(extensions: Vec<ExtensionInfo>) -> Self {
        let licensed = extensions
            .iter()
            .any(|e| e.is_registered() && e.name.eq_ignore_ascii_case(LICENSED_EXTENSION));
        Self {
            extensions,
            licensed,
        }
    }

    pub fn extensions(&self) -> &[ExtensionInfo] {
        &self.extensions
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionInfo> {
        self.extensions
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Whether the licensed extension registered successfully
    pub fn is_licensed(&self) -> bool {
        self.licensed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_display_round_trips() {
        assert_eq!(ExtensionStatus::Registered.to_string(), "registered");
        assert_eq!(
            ExtensionStatus::from_str("failed").unwrap(),
            ExtensionStatus::Failed
        );
    }

    #[test]
    fn test_report_detects_licensed() {
        let report = ExtensionReport::new(vec![
            ExtensionInfo::unloaded("Nougat.Licensed", ExtensionStatus::Registered, None),
            ExtensionInfo::unloaded("other", ExtensionStatus::Failed, Some("boom".into())),
        ]);
        assert!(report.is_licensed());
        assert_eq!(report.get("OTHER").map(|e| e.status), Some(ExtensionStatus::Failed));

        let rejected = ExtensionReport::new(vec![ExtensionInfo::unloaded(
            LICENSED_EXTENSION,
            ExtensionStatus::Rejected,
            None,
        )]);
        assert!(!rejected.is_licensed());
    }
}
