// src/loader/mod.rs
//! Trusted module loading
//!
//! Extension modules are shipped as signed module images (`<name>.ngm`).
//! Loading one means reading the image into memory, checking its signing
//! identity against what the caller expects, and publishing it in the
//! process-wide [`AssemblyCache`] so that it is never read from disk twice.
//!
//! # Identity
//!
//! A module's identity is a [`KeyToken`]: the first eight bytes of the
//! SHA-256 digest of the Ed25519 public key that signed it, as lower-case
//! hex. An image whose signature does not verify has no identity.
//!
//! # Locking
//!
//! Every mutating operation takes a single load lock with a bounded wait
//! ([`DEFAULT_LOCK_TIMEOUT`]). Failing to get the lock in time is fatal;
//! the loader never blocks indefinitely and never proceeds without it.

mod cache;
pub mod hook;
pub mod image;
pub mod signing;
mod trusted;

pub use cache::{AssemblyCache, LoadGuard};
pub use hook::{HookOutcome, ModuleRequest, ResolutionHook};
pub use image::{ImageError, ModuleImage, ModuleManifest, ModuleSignature};
pub use signing::SigningKeyPair;
pub use trusted::{Discovery, TrustedLoader};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// File extension of module images
pub const MODULE_EXTENSION: &str = "ngm";

/// Name of the main application module
pub const PRIMARY_MODULE: &str = "nougat";

/// Name the main application module shipped under before it was renamed
pub const LEGACY_MODULE: &str = "nougatlib";

/// Bound on waiting for the load lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Key token of the vendor key that signs first-party modules
pub const VENDOR_KEY_TOKEN: &str = "79d02ea9cad655eb";

/// Errors raised by the loader
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Timed out after {0:?} waiting for the module load lock")]
    LockTimeout(Duration),

    #[error("Failed to read module {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid module image {path}: {source}")]
    InvalidImage {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("Failed to scan extensions directory {path}: {message}")]
    Scan { path: PathBuf, message: String },
}

impl LoadError {
    /// Whether the error must abort startup rather than skip one module
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

/// Error parsing a key token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid key token '{0}': expected 16 hexadecimal characters")]
pub struct KeyTokenError(String);

/// Signing identity of a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyToken(String);

impl KeyToken {
    /// Token for an Ed25519 public key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self(hex::encode(&digest[..8]))
    }

    /// The vendor token compiled into this binary
    pub fn vendor() -> Self {
        Self(VENDOR_KEY_TOKEN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for KeyToken {
    type Err = KeyTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        if token.len() == 16 && token.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(token))
        } else {
            Err(KeyTokenError(s.to_string()))
        }
    }
}

impl TryFrom<String> for KeyToken {
    type Error = KeyTokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyToken> for String {
    fn from(token: KeyToken) -> Self {
        token.0
    }
}

impl fmt::Display for KeyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a loaded module points at
#[derive(Debug, Clone)]
pub enum ModuleHandle {
    /// Linked into the running process
    Process,
    /// Loaded from a module image
    Image {
        manifest: ModuleManifest,
        source: PathBuf,
    },
}

/// A resolved module; shared, never mutated
#[derive(Debug)]
pub struct LoadedModule {
    name: String,
    identity: Option<KeyToken>,
    handle: ModuleHandle,
}

impl LoadedModule {
    /// A module that is part of the running process
    pub fn process(name: impl Into<String>, identity: Option<KeyToken>) -> Self {
        Self {
            name: name.into(),
            identity,
            handle: ModuleHandle::Process,
        }
    }

    pub(crate) fn from_image(image: ModuleImage, source: &Path) -> Self {
        let identity = image.identity().cloned();
        let manifest = image.into_manifest();
        Self {
            name: manifest.name.clone(),
            identity,
            handle: ModuleHandle::Image {
                manifest,
                source: source.to_path_buf(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> Option<&KeyToken> {
        self.identity.as_ref()
    }

    pub fn handle(&self) -> &ModuleHandle {
        &self.handle
    }

    pub fn manifest(&self) -> Option<&ModuleManifest> {
        match &self.handle {
            ModuleHandle::Image { manifest, .. } => Some(manifest),
            ModuleHandle::Process => None,
        }
    }

    pub fn source(&self) -> Option<&Path> {
        match &self.handle {
            ModuleHandle::Image { source, .. } => Some(source),
            ModuleHandle::Process => None,
        }
    }

    /// Whether the identity is `expected`; `None` accepts anything
    pub fn matches(&self, expected: Option<&KeyToken>) -> bool {
        match expected {
            None => true,
            Some(expected) => self.identity.as_ref() == Some(expected),
        }
    }

    /// First of `candidates` equal to this module's identity
    ///
    /// An empty candidate list accepts any module, signed or not.
    pub fn accepted_by(&self, candidates: &[KeyToken]) -> bool {
        candidates.is_empty()
            || candidates
                .iter()
                .any(|candidate| self.identity.as_ref() == Some(candidate))
    }
}

/// Cache key for a simple name
pub(crate) fn cache_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// The other name of the main module, if `name` is one of its two names
pub fn legacy_alias(name: &str) -> Option<&'static str> {
    match cache_key(name).as_str() {
        PRIMARY_MODULE => Some(LEGACY_MODULE),
        LEGACY_MODULE => Some(PRIMARY_MODULE),
        _ => None,
    }
}

/// File name a module image is expected under
pub fn module_file_name(name: &str) -> String {
    format!("{}.{}", name, MODULE_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_token_parse_normalizes_case() {
        let token: KeyToken = "79D02EA9CAD655EB".parse().unwrap();
        assert_eq!(token, KeyToken::vendor());
        assert!("79d02ea9".parse::<KeyToken>().is_err());
        assert!("zzd02ea9cad655eb".parse::<KeyToken>().is_err());
    }

    #[test]
    fn test_key_token_from_public_key() {
        let pair = SigningKeyPair::generate();
        let token = KeyToken::from_public_key(&pair.verifying_key());
        assert_eq!(token.as_str().len(), 16);
        assert_eq!(token, pair.key_token());
    }

    #[test]
    fn test_legacy_alias_is_symmetric() {
        assert_eq!(legacy_alias("nougat"), Some(LEGACY_MODULE));
        assert_eq!(legacy_alias("NougatLib"), Some(PRIMARY_MODULE));
        assert_eq!(legacy_alias("nougat.licensed"), None);
    }

    #[test]
    fn test_accepted_by() {
        let token = KeyToken::vendor();
        let signed = LoadedModule::process("a", Some(token.clone()));
        let unsigned = LoadedModule::process("b", None);

        assert!(signed.accepted_by(&[]));
        assert!(signed.accepted_by(std::slice::from_ref(&token)));
        assert!(unsigned.accepted_by(&[]));
        assert!(!unsigned.accepted_by(&[token]));
    }
}
