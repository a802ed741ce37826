//! Every invocation of the service binary starts here.
//!
//! The checks run first, in a fixed order, then exactly one mode. Each mode maps its
//! failures to a distinct [`Exit`] code so installers and scripts can tell them apart.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Result;
use bin_shared::known_dirs;
use bin_shared::signals::Terminate;
use security_descriptor::Sid;
use tracing::subscriber::DefaultGuard;

use crate::cli::{self, Command, DaemonArgs, UsageError};
use crate::daemon::{self, Dispatcher};
use crate::dir_guard::{self, FileSecurity, NativeFileSecurity};
use crate::installer::{self, ServiceControlManager, SystemServiceManager};
use crate::instance_lock::{InstallationIdentity, InstanceLock};
use crate::integrity::{
    self, PresenceVerifier, SettingsFile, SettingsValidator, SignatureVerifier,
};
use crate::service::{self, ServiceContext, ServiceStart};
use crate::settings::Settings;
use crate::updater;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Exit {
    Success = 0,
    /// Renamed binary, failed verification or bad arguments.
    Usage = 1,
    Generic = 2,
    /// The service object exists but couldn't be set up.
    Installer = 3,
    /// The working directory's ACL couldn't be reset.
    Acl = 4,
    /// Started interactively without a mode, or a daemon of this installation is already running.
    Refused = -1,
}

impl Exit {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Runs one invocation of the service binary, `args` without the binary name.
pub fn run(args: Vec<OsString>) -> Exit {
    let log_guard = logging::setup_bootstrap()
        .inspect_err(|error| explain(&format!("Failed to set up logging: {error:#}")))
        .ok();

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => {
            tracing::error!("Can't find our own executable: {error}");
            return Exit::Generic;
        }
    };
    let install_dir = match known_dirs::install_dir_of(&exe) {
        Ok(dir) => dir,
        Err(error) => {
            tracing::error!("{error:#}");
            return Exit::Generic;
        }
    };
    // Relative paths in settings and from the launcher are relative to the install dir.
    if let Err(error) = std::env::set_current_dir(&install_dir) {
        tracing::error!(dir = %install_dir.display(), "Failed to enter the install directory: {error}");
        return Exit::Generic;
    }

    let settings = SettingsFile::new(known_dirs::settings_file(&install_dir));

    Bootstrap {
        exe,
        install_dir,
        verifier: &PresenceVerifier,
        settings: &settings,
    }
    .run(args, log_guard)
}

/// The collaborators of one invocation.
pub struct Bootstrap<'a> {
    pub exe: PathBuf,
    pub install_dir: PathBuf,
    pub verifier: &'a dyn SignatureVerifier,
    pub settings: &'a dyn SettingsValidator,
}

impl Bootstrap<'_> {
    /// `log_guard` is the stdout logger of the one-shot modes, dropped once a
    /// long-running mode has its own logging.
    pub fn run(self, args: Vec<OsString>, log_guard: Option<DefaultGuard>) -> Exit {
        let settings = match self.settings.validate() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::error!("Settings are invalid: {error:#}");
                return Exit::Generic;
            }
        };

        let tunnel_client = settings.tunnel_client_path(&self.install_dir);
        if let Err(error) = self.verifier.verify(&[&self.exe, &tunnel_client]) {
            tracing::error!("Verification failed: {error:#}");
            return Exit::Usage;
        }

        if !integrity::has_expected_name(&self.exe) {
            explain(&format!(
                "This program must be named `{}` to run, it is `{}`. Rename it back and try again.",
                bin_shared::service_binary_name(),
                self.exe.display()
            ));
            return Exit::Usage;
        }

        let command = match cli::parse(args) {
            Ok(command) => command,
            Err(UsageError::Daemon(error)) => {
                if let Err(print_error) = error.print() {
                    tracing::debug!("Couldn't print the usage message: {print_error}");
                    tracing::error!("{error}");
                }
                return Exit::Usage;
            }
            Err(error) => {
                tracing::error!("{error}");
                return Exit::Usage;
            }
        };
        let working_dir = known_dirs::working_dir(&self.install_dir);

        match command {
            Command::Install => match SystemServiceManager::connect() {
                Ok(scm) => install_service(&scm, &NativeFileSecurity, &self.exe, &working_dir),
                Err(error) => install_failed(&error),
            },
            Command::Uninstall => match SystemServiceManager::connect() {
                Ok(scm) => uninstall_service(
                    &scm,
                    &NativeFileSecurity,
                    &working_dir,
                    dir_guard::current_user_sid,
                ),
                Err(error) => {
                    tracing::error!("Failed to uninstall the service: {error}");
                    Exit::Generic
                }
            },
            Command::Daemon(args) => self.daemon(settings, args, log_guard),
            Command::Update { target, extra } => {
                match updater::hand_off(&self.install_dir, &target, extra.as_ref()) {
                    Ok(()) => Exit::Success,
                    Err(error) => {
                        tracing::error!("Update handoff failed: {error:#}");
                        Exit::Generic
                    }
                }
            }
            Command::Service => self.service(settings, log_guard),
        }
    }

    fn daemon(self, settings: Settings, args: DaemonArgs, log_guard: Option<DefaultGuard>) -> Exit {
        // Taken before anything else so a duplicate never touches the control channel.
        let _lock = match InstanceLock::acquire(&InstallationIdentity::of(&self.install_dir)) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                explain("The Tunnelkeeper daemon is already running for this installation.");
                return Exit::Refused;
            }
            Err(error) => {
                tracing::error!("Failed to take the instance lock: {error:#}");
                return Exit::Generic;
            }
        };

        let log_dir = args
            .log_dir
            .unwrap_or_else(|| known_dirs::logs(&self.install_dir));
        let directives = args
            .log_filter
            .unwrap_or_else(|| settings.log_filter.clone());
        let _log_handle = match daemon::setup_logging(&log_dir, &directives, true) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!("{error:#}");
                return Exit::Generic;
            }
        };
        drop(log_guard);

        match daemon::block_on(Dispatcher::new(settings, self.install_dir), Terminate::new) {
            Ok(()) => Exit::Success,
            Err(error) => {
                tracing::error!("Daemon failed: {error:#}");
                Exit::Generic
            }
        }
    }

    fn service(self, settings: Settings, log_guard: Option<DefaultGuard>) -> Exit {
        // The service installs its own logger, which the bootstrap one would shadow.
        drop(log_guard);

        let context = ServiceContext {
            install_dir: self.install_dir,
            settings,
        };

        match service::run(context) {
            Ok(ServiceStart::Finished) => Exit::Success,
            Ok(ServiceStart::NotUnderServiceManager) => {
                explain(
                    "The Tunnelkeeper service is started by the system. \
                     To run it by hand, use `--daemon`. To register it, use `--install`.",
                );
                Exit::Refused
            }
            Ok(ServiceStart::AlreadyRunning) => {
                explain("The Tunnelkeeper daemon is already running for this installation.");
                Exit::Refused
            }
            Err(error) => {
                explain(&format!("Service failed: {error:#}"));
                Exit::Generic
            }
        }
    }
}

/// Registers the service, then hands the working directory to the service account.
pub fn install_service<M, F>(scm: &M, files: &F, exe: &Path, working_dir: &Path) -> Exit
where
    M: ServiceControlManager,
    F: FileSecurity + ?Sized,
{
    match installer::install(scm, files, exe) {
        Ok(outcome) => tracing::info!(?outcome, exe = %exe.display(), "Service registered"),
        Err(error) => return install_failed(&error),
    }

    match dir_guard::reset_ownership(files, working_dir, &Sid::local_service()) {
        Ok(()) => Exit::Success,
        Err(error) => {
            tracing::error!("{}", logging::err_with_src(&error));
            Exit::Acl
        }
    }
}

/// Removes the service, then hands the working directory back to the user running us.
pub fn uninstall_service<M, F>(
    scm: &M,
    files: &F,
    working_dir: &Path,
    current_user: impl FnOnce() -> Result<Sid>,
) -> Exit
where
    M: ServiceControlManager,
    F: FileSecurity + ?Sized,
{
    match installer::uninstall(scm) {
        Ok(outcome) => tracing::info!(?outcome, "Service unregistered"),
        Err(error) => {
            tracing::error!(
                "Failed to uninstall the service: {}",
                logging::err_with_src(&error)
            );
            return Exit::Generic;
        }
    }

    let user = match current_user() {
        Ok(user) => user,
        Err(error) => {
            tracing::error!("Can't tell who is uninstalling: {error:#}");
            return Exit::Acl;
        }
    };
    match dir_guard::reset_ownership(files, working_dir, &user) {
        Ok(()) => Exit::Success,
        Err(error) => {
            tracing::error!("{}", logging::err_with_src(&error));
            Exit::Acl
        }
    }
}

fn install_failed(error: &installer::InstallError) -> Exit {
    tracing::error!(
        "Failed to install the service: {}",
        logging::err_with_src(error)
    );

    if error.is_installer_specific() {
        Exit::Installer
    } else {
        Exit::Generic
    }
}

#[expect(
    clippy::print_stderr,
    reason = "Interactive users must see this even when logging isn't set up"
)]
fn explain(message: &str) {
    eprintln!("{message}");
}
