// src/loader/image.rs
//! Module image format
//!
//! ```text
//! +------+---------+--------------------------------------------+
//! | NGXM | version | CBOR envelope                              |
//! | 4 B  | 1 B     | { manifest: CBOR bytes, payload, signature }|
//! +------+---------+--------------------------------------------+
//! ```
//!
//! The signature covers the encoded manifest bytes, and the manifest carries
//! the SHA-256 of the payload, so one Ed25519 signature authenticates the
//! whole image. An image whose signature or payload digest does not check
//! out still parses; it just has no identity.

use super::{KeyToken, ModuleRequest};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Leading magic bytes of every module image
pub const IMAGE_MAGIC: &[u8; 4] = b"NGXM";

/// Current image format version
pub const FORMAT_VERSION: u8 = 1;

/// Image parsing and encoding errors
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image is truncated")]
    Truncated,

    #[error("Not a module image (bad magic)")]
    BadMagic,

    #[error("Unsupported image format version {0}")]
    UnsupportedVersion(u8),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),
}

/// Module metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Simple name; the image file is `<name>.ngm`
    pub name: String,

    pub version: String,

    /// Registration entry point symbol exported by the module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,

    #[serde(default)]
    pub description: String,

    /// SHA-256 of the payload, hex
    pub payload_sha256: String,

    /// Modules that must resolve before this one can register
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<ModuleRequest>,
}

impl ModuleManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            entry_point: None,
            description: String::new(),
            payload_sha256: hex::encode(Sha256::digest(payload)),
            requires: Vec::new(),
        }
    }

    pub fn with_requirement(mut self, request: ModuleRequest) -> Self {
        self.requires.push(request);
        self
    }

    pub fn with_entry_point(mut self, symbol: impl Into<String>) -> Self {
        self.entry_point = Some(symbol.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Detached Ed25519 signature over the encoded manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSignature {
    /// Signature algorithm (currently only "ed25519")
    pub algorithm: String,
    /// Base64-encoded signature bytes
    pub signature: String,
    /// Base64-encoded public key
    pub public_key: String,
    #[serde(default)]
    pub key_id: Option<String>,
    /// RFC 3339
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ModuleSignature {
    /// Signature made by `key`, stamped with the current time
    pub fn ed25519(key: &VerifyingKey, signature: &Signature, key_id: Option<String>) -> Self {
        Self {
            algorithm: "ed25519".to_string(),
            signature: BASE64.encode(signature.to_bytes()),
            public_key: BASE64.encode(key.as_bytes()),
            key_id,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

/// Outcome of checking an image's signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid(KeyToken),
    Unsigned,
    Invalid(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    manifest: Vec<u8>,
    payload: Vec<u8>,
    #[serde(default)]
    signature: Option<ModuleSignature>,
}

/// A parsed module image
#[derive(Debug, Clone)]
pub struct ModuleImage {
    manifest: ModuleManifest,
    payload: Vec<u8>,
    signature: Option<ModuleSignature>,
    status: SignatureStatus,
}

impl ModuleImage {
    /// Parse and verify an image held in memory
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < IMAGE_MAGIC.len() + 1 {
            return Err(ImageError::Truncated);
        }
        if &bytes[..4] != IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(ImageError::UnsupportedVersion(bytes[4]));
        }

        let envelope: Envelope =
            ciborium::from_reader(&bytes[5..]).map_err(|e| ImageError::Decode(e.to_string()))?;
        let manifest: ModuleManifest = ciborium::from_reader(envelope.manifest.as_slice())
            .map_err(|e| ImageError::Decode(format!("manifest: {}", e)))?;

        let status = match &envelope.signature {
            None => SignatureStatus::Unsigned,
            Some(signature) => verify(&envelope.manifest, &manifest, &envelope.payload, signature),
        };

        Ok(Self {
            manifest,
            payload: envelope.payload,
            signature: envelope.signature,
            status,
        })
    }

    /// Encode an image, signing it when `signer` is given
    pub fn encode(
        manifest: &ModuleManifest,
        payload: &[u8],
        signer: Option<&super::SigningKeyPair>,
    ) -> Result<Vec<u8>, ImageError> {
        let mut manifest_bytes = Vec::new();
        ciborium::into_writer(manifest, &mut manifest_bytes)
            .map_err(|e| ImageError::Encode(e.to_string()))?;

        let signature = signer.map(|pair| pair.sign_manifest(&manifest_bytes));
        let envelope = Envelope {
            manifest: manifest_bytes,
            payload: payload.to_vec(),
            signature,
        };

        let mut out = Vec::with_capacity(envelope.payload.len() + 256);
        out.extend_from_slice(IMAGE_MAGIC);
        out.push(FORMAT_VERSION);
        ciborium::into_writer(&envelope, &mut out).map_err(|e| ImageError::Encode(e.to_string()))?;
        Ok(out)
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn signature(&self) -> Option<&ModuleSignature> {
        self.signature.as_ref()
    }

    pub fn status(&self) -> &SignatureStatus {
        &self.status
    }

    /// Verified signing identity, if any
    pub fn identity(&self) -> Option<&KeyToken> {
        match &self.status {
            SignatureStatus::Valid(token) => Some(token),
            _ => None,
        }
    }

    pub fn into_manifest(self) -> ModuleManifest {
        self.manifest
    }
}

fn verify(
    manifest_bytes: &[u8],
    manifest: &ModuleManifest,
    payload: &[u8],
    signature: &ModuleSignature,
) -> SignatureStatus {
    if signature.algorithm != "ed25519" {
        return SignatureStatus::Invalid(format!(
            "unsupported algorithm {}",
            signature.algorithm
        ));
    }

    let key = match decode_public_key(&signature.public_key) {
        Ok(key) => key,
        Err(reason) => return SignatureStatus::Invalid(reason),
    };
    let sig = match BASE64
        .decode(&signature.signature)
        .map_err(|e| e.to_string())
        .and_then(|bytes| Signature::from_slice(&bytes).map_err(|e| e.to_string()))
    {
        Ok(sig) => sig,
        Err(reason) => return SignatureStatus::Invalid(format!("malformed signature: {}", reason)),
    };

    if let Err(e) = key.verify_strict(manifest_bytes, &sig) {
        return SignatureStatus::Invalid(format!("signature does not verify: {}", e));
    }

    let digest = hex::encode(Sha256::digest(payload));
    if !digest.eq_ignore_ascii_case(&manifest.payload_sha256) {
        return SignatureStatus::Invalid("payload digest mismatch".to_string());
    }

    SignatureStatus::Valid(KeyToken::from_public_key(&key))
}

fn decode_public_key(encoded: &str) -> Result<VerifyingKey, String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| format!("malformed public key: {}", e))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "public key has the wrong length".to_string())?;
    VerifyingKey::from_bytes(&array).map_err(|e| format!("invalid public key: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SigningKeyPair;

    fn manifest(payload: &[u8]) -> ModuleManifest {
        ModuleManifest::new("nougat.extras", "1.2.0", payload)
            .with_entry_point("nougat_extras_register")
            .with_description("Extra commands")
    }

    #[test]
    fn test_signed_image_has_identity() {
        let pair = SigningKeyPair::generate().with_label("release");
        let payload = b"module payload";
        let bytes = ModuleImage::encode(&manifest(payload), payload, Some(&pair)).unwrap();

        let image = ModuleImage::parse(&bytes).unwrap();
        assert_eq!(image.identity(), Some(&pair.key_token()));
        assert_eq!(image.manifest().name, "nougat.extras");
        assert_eq!(
            image.manifest().entry_point.as_deref(),
            Some("nougat_extras_register")
        );
        assert_eq!(image.payload(), payload);
        assert_eq!(
            image.signature().and_then(|s| s.key_id.as_deref()),
            Some("release")
        );
    }

    #[test]
    fn test_unsigned_image_has_no_identity() {
        let payload = b"unsigned";
        let bytes = ModuleImage::encode(&manifest(payload), payload, None).unwrap();
        let image = ModuleImage::parse(&bytes).unwrap();
        assert_eq!(image.status(), &SignatureStatus::Unsigned);
        assert!(image.identity().is_none());
    }

    #[test]
    fn test_tampered_payload_loses_identity() {
        let pair = SigningKeyPair::generate();
        let signed_payload = b"original";
        let mut bytes =
            ModuleImage::encode(&manifest(signed_payload), signed_payload, Some(&pair)).unwrap();

        // Re-encode with a different payload but the original manifest and signature
        let image = ModuleImage::parse(&bytes).unwrap();
        let envelope = Envelope {
            manifest: {
                let mut m = Vec::new();
                ciborium::into_writer(image.manifest(), &mut m).unwrap();
                m
            },
            payload: b"tampered".to_vec(),
            signature: image.signature().cloned(),
        };
        bytes.truncate(5);
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        let tampered = ModuleImage::parse(&bytes).unwrap();
        assert!(matches!(tampered.status(), SignatureStatus::Invalid(_)));
        assert!(tampered.identity().is_none());
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        assert!(matches!(ModuleImage::parse(b"MZ"), Err(ImageError::Truncated)));
        assert!(matches!(
            ModuleImage::parse(b"MZ\x90\x00\x03\x00"),
            Err(ImageError::BadMagic)
        ));
        assert!(matches!(
            ModuleImage::parse(b"NGXM\x09rest"),
            Err(ImageError::UnsupportedVersion(9))
        ));
    }
}
