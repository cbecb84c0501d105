// src/config.rs
//! Application configuration
//!
//! Read from `config.toml` in the user's config directory unless a path is
//! given explicitly. Every field has a default, so an empty or missing file
//! is a valid configuration.
//!
//! ```toml
//! extensions_dir = "/opt/nougat/extensions"
//! allow_replacing_registrations = false
//! disabled_extensions = ["nougat.experimental"]
//!
//! [trust]
//! vendor_key = "79d02ea9cad655eb"
//! trusted_keys = ["0123456789abcdef"]
//! ```

use crate::loader::KeyToken;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NougatConfig {
    /// Directory scanned for extension module images
    pub extensions_dir: PathBuf,

    /// Directory the application itself was installed to
    pub install_dir: Option<PathBuf>,

    /// Let core and same-origin registrations replace each other's commands
    pub allow_replacing_registrations: bool,

    /// Accept extensions that are unsigned or signed by an unknown key
    pub allow_unsigned_extensions: bool,

    /// Extensions that are reported but never loaded
    pub disabled_extensions: Vec<String>,

    pub trust: TrustConfig,
}

/// Which signing identities are trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Key token of first-party modules, including the licensed extension
    pub vendor_key: KeyToken,

    /// Additional keys accepted for third-party extensions
    pub trusted_keys: Vec<KeyToken>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            vendor_key: KeyToken::vendor(),
            trusted_keys: Vec::new(),
        }
    }
}

impl Default for NougatConfig {
    fn default() -> Self {
        Self {
            extensions_dir: default_data_dir().join("extensions"),
            install_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
            allow_replacing_registrations: false,
            allow_unsigned_extensions: false,
            disabled_extensions: Vec::new(),
            trust: TrustConfig::default(),
        }
    }
}

impl NougatConfig {
    /// Load from `path`, or from the default location when `None`
    ///
    /// An explicit path must exist. A missing default file yields the
    /// default configuration.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    debug!("No config file at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn with_extensions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extensions_dir = dir.into();
        self
    }

    /// Identities an extension may be signed with
    ///
    /// Empty when unsigned extensions are allowed, which accepts any module.
    pub fn accepted_identities(&self) -> Vec<KeyToken> {
        if self.allow_unsigned_extensions {
            return Vec::new();
        }
        let mut keys = vec![self.trust.vendor_key.clone()];
        for key in &self.trust.trusted_keys {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    pub fn is_disabled(&self, extension: &str) -> bool {
        self.disabled_extensions
            .iter()
            .any(|name| name.eq_ignore_ascii_case(extension))
    }
}

/// `<config dir>/nougat/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nougat")
        .join(CONFIG_FILE_NAME)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nougat")
}
