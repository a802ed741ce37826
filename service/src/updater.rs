//! Hands an update off to the bundled updater.
//!
//! The service only writes the updater next to itself and starts it detached.
//! Downloading and verifying the new version is the updater's job.

use std::ffi::OsString;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context as _, Result, bail};
use atomicwrites::{AtomicFile, OverwriteBehavior};

/// Embedded by `build.rs`, empty unless the build was given one.
const PAYLOAD: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/updater.bin"));

/// `DETACHED_PROCESS`, the updater must outlive us and has no console to share.
#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;

/// `CREATE_NEW_PROCESS_GROUP`, so a Ctrl+C aimed at us doesn't reach the updater.
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Writes the updater to `install_dir` and starts it with `target` and `extra`.
///
/// Returns as soon as the updater is running, without waiting for it.
pub fn hand_off(install_dir: &Path, target: &OsString, extra: Option<&OsString>) -> Result<()> {
    let path = updater_path(install_dir);
    write_updater(PAYLOAD, &path)?;

    let pid = spawn_detached(&path, target, extra)?;
    tracing::info!(%pid, updater = %path.display(), "Handed off to the updater");

    Ok(())
}

fn write_updater(payload: &[u8], path: &Path) -> Result<()> {
    if payload.is_empty() {
        bail!("This build doesn't bundle an updater");
    }

    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|f| f.write_all(payload))
        .with_context(|| format!("Failed to write updater to `{}`", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .context("Failed to make the updater executable")?;
    }

    Ok(())
}

fn spawn_detached(updater: &Path, target: &OsString, extra: Option<&OsString>) -> Result<u32> {
    let mut command = Command::new(updater);
    command
        .arg(target)
        .args(extra)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt as _;

        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;

        command.process_group(0);
    }

    let child = command
        .spawn()
        .with_context(|| format!("Failed to start `{}`", updater.display()))?;

    Ok(child.id())
}

/// Where `hand_off` puts the updater.
pub fn updater_path(install_dir: &Path) -> PathBuf {
    install_dir.join(bin_shared::updater_binary_name())
}
