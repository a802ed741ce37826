//! Where the service keeps its files.
//!
//! Everything the service writes lives next to its binary. The install directory is
//! the trust anchor: the installer grants the service account access to it and the
//! working directory below it has its ACL reset on install and uninstall.

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};

/// The directory containing the running executable, e.g. `C:\Program Files\Tunnelkeeper`
pub fn install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Can't find our own executable")?;

    install_dir_of(&exe)
}

pub fn install_dir_of(exe: &Path) -> Result<PathBuf> {
    let dir = exe
        .parent()
        .with_context(|| format!("`{}` has no parent directory", exe.display()))?;

    Ok(dir.to_path_buf())
}

/// e.g. `C:\Program Files\Tunnelkeeper\data`
///
/// Owned by the service account while the service is installed, by the installing user otherwise.
pub fn working_dir(install_dir: &Path) -> PathBuf {
    install_dir.join("data")
}

/// e.g. `C:\Program Files\Tunnelkeeper\data\logs`
pub fn logs(install_dir: &Path) -> PathBuf {
    working_dir(install_dir).join("logs")
}

/// e.g. `C:\Program Files\Tunnelkeeper\data\settings.json`
///
/// All writes should use `atomicwrites`.
pub fn settings_file(install_dir: &Path) -> PathBuf {
    working_dir(install_dir).join("settings.json")
}

/// e.g. `/run/user/1000/dev.tunnelkeeper.service`
///
/// Holds the control socket and the instance lock file.
/// Falls back to the temp dir when there is no `$XDG_RUNTIME_DIR`, e.g. on macOS.
#[cfg(unix)]
pub fn runtime() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(crate::BUNDLE_ID)
}
