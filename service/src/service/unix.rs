use std::io::IsTerminal as _;

use anyhow::Result;
use bin_shared::{known_dirs, signals::Terminate};

use super::{ServiceContext, ServiceStart};
use crate::daemon::{self, Dispatcher};
use crate::instance_lock::{InstallationIdentity, InstanceLock};

/// Entry point for systemd and launchd.
///
/// A terminal on stdin means a human started us, which the service manager never does.
pub fn run(context: ServiceContext) -> Result<ServiceStart> {
    let ServiceContext {
        install_dir,
        settings,
    } = context;
    let Some(_lock) = InstanceLock::acquire(&InstallationIdentity::of(&install_dir))? else {
        tracing::warn!("Another daemon of this installation is already running");
        return Ok(ServiceStart::AlreadyRunning);
    };

    if std::io::stdin().is_terminal() {
        return Ok(ServiceStart::NotUnderServiceManager);
    }

    // The journal captures stdout, so log there too.
    let _log_handle = daemon::setup_logging(&known_dirs::logs(&install_dir), &settings.log_filter, true)?;
    daemon::block_on(Dispatcher::new(settings, install_dir), Terminate::new)?;

    Ok(ServiceStart::Finished)
}
