#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod known_dirs;
pub mod signals;
pub mod win32;

/// Bundle ID that the service uses to distinguish itself from other programs on the system
///
/// Named pipes, the Unix runtime directory and log file names are derived from this.
pub const BUNDLE_ID: &str = "dev.tunnelkeeper.service";

/// Name the service is registered under with the service control manager.
///
/// Also prefixes the name of the instance lock.
pub const SERVICE_NAME: &str = "TunnelkeeperService";

pub const SERVICE_DISPLAY_NAME: &str = "Tunnelkeeper Service";

pub const SERVICE_DESCRIPTION: &str =
    "Runs the Tunnelkeeper tunnel client in the background and lets the launcher control it.";

/// The file stem the service binary must keep.
///
/// The installer registers the service by absolute path and the launcher finds
/// the binary by name, so a renamed copy would end up half-installed.
pub const SERVICE_BINARY_STEM: &str = "tunnelkeeper-service";

const UPDATER_BINARY_STEM: &str = "tunnelkeeper-updater";

/// e.g. `tunnelkeeper-service.exe` on Windows and `tunnelkeeper-service` elsewhere.
pub fn service_binary_name() -> String {
    format!("{SERVICE_BINARY_STEM}{}", std::env::consts::EXE_SUFFIX)
}

pub fn updater_binary_name() -> String {
    format!("{UPDATER_BINARY_STEM}{}", std::env::consts::EXE_SUFFIX)
}
