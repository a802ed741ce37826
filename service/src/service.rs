//! Running under the OS service manager.

use std::path::PathBuf;

use crate::settings::Settings;

pub use platform::run;

#[cfg(unix)]
#[path = "service/unix.rs"]
mod platform;

#[cfg(windows)]
#[path = "service/windows.rs"]
mod platform;

/// How a service-mode start ended.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum ServiceStart {
    /// Ran and stopped when the service manager asked.
    Finished,
    /// Started by hand instead of by the service manager.
    NotUnderServiceManager,
    /// Another daemon of this installation holds the instance lock.
    AlreadyRunning,
}

/// What the daemon needs to start. Owned by whoever runs it.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub install_dir: PathBuf,
    pub settings: Settings,
}
