//! Checks that run before the bootstrap trusts the files next to it.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::settings::Settings;

/// Verifies the binaries the service is about to run or register.
///
/// Release builds plug in a code-signing check. The default only makes sure the files are there.
pub trait SignatureVerifier {
    fn verify(&self, files: &[&Path]) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PresenceVerifier;

impl SignatureVerifier for PresenceVerifier {
    fn verify(&self, files: &[&Path]) -> Result<()> {
        for file in files {
            match file.metadata() {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => bail!("`{}` is not a file", file.display()),
                Err(e) => bail!("`{}` is missing: {e}", file.display()),
            }
        }

        Ok(())
    }
}

/// Runs once at startup, before any mode, and yields the settings the mode should use.
pub trait SettingsValidator {
    fn validate(&self) -> Result<Settings>;
}

/// Validates the JSON file in the working directory, repairing it if it's unreadable.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SettingsValidator for SettingsFile {
    fn validate(&self) -> Result<Settings> {
        Settings::load_validated(&self.path)
    }
}

/// The service binary must not be renamed, see [`bin_shared::SERVICE_BINARY_STEM`].
pub fn has_expected_name(exe: &Path) -> bool {
    exe.file_name().is_some_and(|name| {
        let name = name.to_string_lossy();
        if cfg!(windows) {
            name.eq_ignore_ascii_case(&bin_shared::service_binary_name())
        } else {
            name == bin_shared::service_binary_name()
        }
    })
}
