//! Makes sure only one service or daemon runs per installation.
//!
//! Two installations in different directories may run side by side, their locks have
//! different names.

use std::path::Path;

use anyhow::Result;
use sha2::{Digest as _, Sha256};

#[cfg(unix)]
#[path = "instance_lock/unix.rs"]
mod platform;

#[cfg(windows)]
#[path = "instance_lock/windows.rs"]
mod platform;

/// Identifies an installation by its directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallationIdentity(String);

impl InstallationIdentity {
    /// Hex of the first 16 bytes of the SHA-256 of the normalised install path.
    ///
    /// Paths are canonicalised when they exist and compared case-insensitively on Windows.
    pub fn of(install_dir: &Path) -> Self {
        let path = normalise(install_dir);
        let mut normalised = path.to_string_lossy().into_owned();
        if cfg!(windows) {
            normalised = normalised.to_lowercase();
        }
        let digest = Sha256::digest(normalised.as_bytes());

        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// e.g. `TunnelkeeperService_3f2a...`
    pub fn lock_name(&self) -> String {
        format!("{}_{}", bin_shared::SERVICE_NAME, self.0)
    }
}

fn normalise(path: &Path) -> std::path::PathBuf {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    // `canonicalize` returns verbatim paths on Windows, the installer never sees those.
    let plain = path
        .to_str()
        .and_then(|text| text.strip_prefix(r"\\?\"))
        .filter(|rest| !rest.starts_with("UNC"))
        .map(std::path::PathBuf::from);

    plain.unwrap_or(path)
}

/// Held for as long as this process is the running instance.
#[derive(Debug)]
pub struct InstanceLock {
    _inner: platform::Lock,
}

impl InstanceLock {
    /// `Ok(None)` if another process holds the lock.
    pub fn acquire(identity: &InstallationIdentity) -> Result<Option<Self>> {
        let Some(inner) = platform::Lock::acquire(&identity.lock_name())? else {
            tracing::debug!(identity = identity.as_str(), "Instance lock is already held");
            return Ok(None);
        };

        Ok(Some(Self { _inner: inner }))
    }
}
