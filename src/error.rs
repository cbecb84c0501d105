// src/error.rs
//! Crate-wide error type

use crate::config::ConfigError;
use crate::loader::LoadError;
use crate::registry::RegistryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether startup must abort
    ///
    /// Post-seal mutation, core registration conflicts, an unreadable
    /// configuration and a load lock timeout all end startup. Other loader
    /// errors are absorbed per extension and never reach this type.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Registry(_) | Self::Config(_) => true,
            Self::Load(e) => e.is_fatal(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_only_lock_timeout_is_a_fatal_load_error() {
        let timeout: Error = LoadError::LockTimeout(Duration::from_secs(5)).into();
        assert!(timeout.is_fatal());

        let scan: Error = LoadError::Scan {
            path: PathBuf::from("/ext"),
            message: "permission denied".to_string(),
        }
        .into();
        assert!(!scan.is_fatal());
    }
}
