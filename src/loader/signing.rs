// src/loader/signing.rs
//! Module signing keys
//!
//! A key lives in a TOML record naming its token, an optional label and the
//! public half. The secret record adds the 32-byte seed. Reading a record
//! re-derives the token from the key it holds, so a record edited to claim
//! another identity is refused instead of silently trusted.

use super::image::ModuleSignature;
use super::KeyToken;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Ed25519 key that gives module images their identity
pub struct SigningKeyPair {
    secret: SigningKey,
    token: KeyToken,
    label: Option<String>,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(secret: SigningKey) -> Self {
        let token = KeyToken::from_public_key(&secret.verifying_key());
        Self {
            secret,
            token,
            label: None,
        }
    }

    /// Label recorded in every signature this key makes, e.g. `release`
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.secret.verifying_key()
    }

    /// Identity that images signed by this key will carry
    pub fn key_token(&self) -> KeyToken {
        self.token.clone()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Signature over the encoded manifest of an image
    pub(crate) fn sign_manifest(&self, manifest_bytes: &[u8]) -> ModuleSignature {
        ModuleSignature::ed25519(
            &self.verifying_key(),
            &self.secret.sign(manifest_bytes),
            self.label.clone(),
        )
    }

    /// Write the secret record to `secret_path` and the public one to `public_path`
    ///
    /// The secret record is created owner-only on Unix.
    pub fn save(&self, secret_path: &Path, public_path: &Path) -> Result<()> {
        let public = self.record(false);
        let secret = self.record(true);

        secret
            .write(secret_path, true)
            .with_context(|| format!("Failed to write secret key: {}", secret_path.display()))?;
        public
            .write(public_path, false)
            .with_context(|| format!("Failed to write public key: {}", public_path.display()))
    }

    /// Load a key pair from its secret record
    pub fn load(path: &Path) -> Result<Self> {
        let record = KeyRecord::read(path)?;
        let public = record.public_key()?;
        let Some(seed) = &record.secret else {
            anyhow::bail!("{} is a public key; signing needs the secret record", path.display());
        };

        let secret = SigningKey::from_bytes(&decode_32("secret", seed)?);
        if secret.verifying_key() != public {
            anyhow::bail!("Secret and public halves in {} do not belong together", path.display());
        }
        Ok(Self {
            secret,
            token: record.token,
            label: record.label,
        })
    }

    fn record(&self, with_secret: bool) -> KeyRecord {
        KeyRecord {
            token: self.token.clone(),
            label: self.label.clone(),
            public: BASE64.encode(self.verifying_key().as_bytes()),
            secret: with_secret.then(|| BASE64.encode(self.secret.to_bytes())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    token: KeyToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    public: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

impl KeyRecord {
    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse key file: {}", path.display()))
    }

    /// Public key, checked against the recorded token
    fn public_key(&self) -> Result<VerifyingKey> {
        let key = VerifyingKey::from_bytes(&decode_32("public", &self.public)?)
            .context("Invalid Ed25519 public key")?;
        let derived = KeyToken::from_public_key(&key);
        if derived != self.token {
            anyhow::bail!(
                "Key record claims token {} but its key has token {}",
                self.token,
                derived
            );
        }
        Ok(key)
    }

    fn write(&self, path: &Path, owner_only: bool) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if owner_only {
                // Mode only applies on creation, so never reuse an existing file
                match fs::remove_file(path) {
                    Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
                options.mode(0o600);
            }
        }
        #[cfg(not(unix))]
        let _ = owner_only;

        let mut file = options.open(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }
}

fn decode_32(field: &str, encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded)
        .with_context(|| format!("Key field '{}' is not valid base64", field))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Key field '{}' must hold 32 bytes", field))
}
