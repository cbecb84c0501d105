// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use nougat::loader::{module_file_name, ModuleImage, ModuleManifest, ModuleRequest, SigningKeyPair};
use nougat::NougatConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch installation: an extensions directory, an install directory and
/// a vendor key the configuration trusts.
///
/// Keep the value alive for the duration of the test; dropping it removes
/// the directories.
pub struct TestInstall {
    pub temp: TempDir,
    pub vendor: SigningKeyPair,
    pub config: NougatConfig,
}

impl TestInstall {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let vendor = SigningKeyPair::generate().with_label("vendor");

        let extensions = temp.path().join("extensions");
        let install = temp.path().join("lib");
        fs::create_dir_all(&extensions).unwrap();
        fs::create_dir_all(&install).unwrap();

        let mut config = NougatConfig::default().with_extensions_dir(&extensions);
        config.install_dir = Some(install);
        config.trust.vendor_key = vendor.key_token();

        Self {
            temp,
            vendor,
            config,
        }
    }

    pub fn extensions_dir(&self) -> &Path {
        &self.config.extensions_dir
    }

    pub fn install_dir(&self) -> PathBuf {
        self.temp.path().join("lib")
    }

    /// Install `<extensions>/<name>/<name>.ngm`
    pub fn install_extension(
        &self,
        name: &str,
        entry_point: &str,
        signer: Option<&SigningKeyPair>,
        requires: &[ModuleRequest],
    ) -> PathBuf {
        let dir = self.extensions_dir().join(name);
        fs::create_dir_all(&dir).unwrap();
        write_image(&dir, name, Some(entry_point), signer, requires)
    }
}

/// Write a module image named `<name>.ngm` into `dir`
pub fn write_image(
    dir: &Path,
    name: &str,
    entry_point: Option<&str>,
    signer: Option<&SigningKeyPair>,
    requires: &[ModuleRequest],
) -> PathBuf {
    let payload = format!("{} payload", name).into_bytes();
    let mut manifest = ModuleManifest::new(name, "1.0.0", &payload)
        .with_description(format!("Test module {}", name));
    if let Some(entry_point) = entry_point {
        manifest = manifest.with_entry_point(entry_point);
    }
    for request in requires {
        manifest = manifest.with_requirement(request.clone());
    }

    let bytes = ModuleImage::encode(&manifest, &payload, signer).unwrap();
    let path = dir.join(module_file_name(name));
    fs::write(&path, bytes).unwrap();
    path
}
