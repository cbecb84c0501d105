// src/cli/module.rs

//! Module signing and packaging
//!
//! Commands for generating signing keys, building module images and
//! inspecting them.

use anyhow::{Context, Result};
use nougat::loader::image::SignatureStatus;
use nougat::loader::{module_file_name, ModuleImage, ModuleManifest, ModuleRequest, SigningKeyPair};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Create a signing key and print the token to trust it by
pub fn cmd_keygen(output: &str, label: Option<String>, force: bool) -> Result<()> {
    let secret_path = Path::new(output).with_extension("private");
    let public_path = Path::new(output).with_extension("public");

    let existing: Vec<&Path> = [secret_path.as_path(), public_path.as_path()]
        .into_iter()
        .filter(|p| p.exists())
        .collect();
    if !force && !existing.is_empty() {
        let names: Vec<String> = existing.iter().map(|p| p.display().to_string()).collect();
        anyhow::bail!("Refusing to overwrite {} (pass --force)", names.join(", "));
    }

    let mut keypair = SigningKeyPair::generate();
    if let Some(label) = label {
        keypair = keypair.with_label(label);
    }
    keypair
        .save(&secret_path, &public_path)
        .context("Failed to save key files")?;

    println!("Key token {}", keypair.key_token());
    println!("  secret: {}", secret_path.display());
    println!("  public: {}", public_path.display());
    println!("Images packed with this key load once the token is listed under");
    println!("[trust] trusted_keys, or set as [trust] vendor_key for first-party modules.");
    Ok(())
}

/// Module manifest as written by hand; the payload digest is computed
#[derive(Debug, Deserialize)]
struct PackSpec {
    name: String,
    version: String,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    requires: Vec<ModuleRequest>,
}

/// Build a module image, signed when a key is given
pub fn cmd_pack(
    manifest_path: &Path,
    payload_path: &Path,
    key_path: Option<&Path>,
    output: Option<PathBuf>,
) -> Result<()> {
    let content = fs::read_to_string(manifest_path)
        .with_context(|| format!("Failed to read manifest: {}", manifest_path.display()))?;
    let spec: PackSpec = toml::from_str(&content)
        .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?;
    let payload = fs::read(payload_path)
        .with_context(|| format!("Failed to read payload: {}", payload_path.display()))?;

    let mut manifest = ModuleManifest::new(&spec.name, &spec.version, &payload)
        .with_description(spec.description);
    if let Some(entry_point) = spec.entry_point {
        manifest = manifest.with_entry_point(entry_point);
    }
    for request in spec.requires {
        manifest = manifest.with_requirement(request);
    }

    let keypair = key_path
        .map(SigningKeyPair::load)
        .transpose()
        .context("Failed to load signing key")?;
    let bytes = ModuleImage::encode(&manifest, &payload, keypair.as_ref())?;

    let output = output.unwrap_or_else(|| PathBuf::from(module_file_name(&spec.name)));
    fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write image: {}", output.display()))?;

    println!("Packed {} {} -> {}", manifest.name, manifest.version, output.display());
    match &keypair {
        Some(pair) => println!("  Signed by key {}", pair.key_token()),
        None => println!("  Unsigned (only loadable with allow_unsigned_extensions)"),
    }
    Ok(())
}

/// Print an image's manifest and signature status
pub fn cmd_inspect(path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let image = ModuleImage::parse(&bytes)
        .with_context(|| format!("{} is not a module image", path.display()))?;
    let manifest = image.manifest();

    println!("Module:      {}", manifest.name);
    println!("Version:     {}", manifest.version);
    println!(
        "Entry point: {}",
        manifest.entry_point.as_deref().unwrap_or(&manifest.name)
    );
    if !manifest.description.is_empty() {
        println!("Description: {}", manifest.description);
    }
    println!("Payload:     {} bytes, sha256 {}", image.payload().len(), manifest.payload_sha256);
    for request in &manifest.requires {
        match &request.identity {
            Some(token) => println!("Requires:    {} (key {})", request.name, token),
            None => println!("Requires:    {}", request.name),
        }
    }

    match image.status() {
        SignatureStatus::Valid(token) => {
            println!("Signature:   valid, key token {}", token);
            if let Some(signature) = image.signature() {
                if let Some(key_id) = &signature.key_id {
                    println!("Key ID:      {}", key_id);
                }
                if let Some(timestamp) = &signature.timestamp {
                    println!("Signed at:   {}", timestamp);
                }
            }
        }
        SignatureStatus::Unsigned => println!("Signature:   none"),
        SignatureStatus::Invalid(reason) => println!("Signature:   INVALID ({})", reason),
    }
    Ok(())
}
