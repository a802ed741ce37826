//! Registers the service with the OS and lets interactive users control it.
//!
//! Install and uninstall are safe to re-run. A service that is registered under a
//! different executable, e.g. after the install directory moved, is replaced.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use bin_shared::win32::{
    ERROR_SERVICE_DOES_NOT_EXIST, ERROR_SERVICE_EXISTS, ERROR_SERVICE_MARKED_FOR_DELETE,
    ERROR_SERVICE_NOT_ACTIVE,
};
use security_descriptor::{
    AccessRights, AccessRule, OsError, ParseError, QueryError, Sid, narrow_service_access,
    query_two_pass,
};

use crate::dir_guard::{self, FileSecurity, FileSecurityError};

#[cfg(unix)]
#[path = "installer/unix.rs"]
mod platform;

#[cfg(windows)]
#[path = "installer/windows.rs"]
mod platform;

pub use platform::SystemServiceManager;

/// What to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub executable: PathBuf,
}

impl ServiceSpec {
    pub fn for_executable(executable: &Path) -> Self {
        Self {
            name: bin_shared::SERVICE_NAME,
            display_name: bin_shared::SERVICE_DISPLAY_NAME,
            description: bin_shared::SERVICE_DESCRIPTION,
            executable: executable.to_path_buf(),
        }
    }
}

/// The OS service manager.
///
/// Services are registered own-process, auto-start, running as `NT AUTHORITY\LocalService`
/// and without launch arguments.
pub trait ServiceControlManager {
    type Service: ServiceHandle;

    fn create(&self, spec: &ServiceSpec) -> Result<(), OsError>;

    /// `Ok(None)` if no service of that name is registered.
    fn open(&self, name: &str) -> Result<Option<Self::Service>, OsError>;
}

/// An opened service.
pub trait ServiceHandle {
    /// The binary path as registered, possibly quoted.
    fn executable_path(&self) -> Result<OsString, OsError>;
    fn is_running(&self) -> Result<bool, OsError>;
    fn stop(&self) -> Result<(), OsError>;
    fn delete(&self) -> Result<(), OsError>;
    /// One call of `QueryServiceObjectSecurity` for the DACL, see [`query_two_pass`].
    fn query_security(&self, buffer: &mut [u8], needed: &mut u32) -> Result<(), OsError>;
    fn set_security(&self, descriptor: &[u8]) -> Result<(), OsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Registered for this executable already. Permissions were narrowed again.
    AlreadyInstalled,
    /// Was registered for another executable and has been replaced.
    Reinstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    Removed,
    NotInstalled,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to grant the service account access to `{}`", path.display())]
    GrantDirectory {
        path: PathBuf,
        #[source]
        source: FileSecurityError,
    },
    #[error("`{}` has no parent directory", .0.display())]
    NoInstallDir(PathBuf),
    #[error("CreateService error: {}", .0.code())]
    Register(OsError),
    #[error("OpenService error: {}", .0.code())]
    Open(OsError),
    /// Opening the service right after registering it failed.
    #[error("OpenService error after registering: {}", .0.code())]
    Locate(OsError),
    #[error("QueryServiceConfig error: {}", .0.code())]
    QueryConfig(OsError),
    #[error("DeleteService error: {}", .0.code())]
    Delete(OsError),
    #[error("Service is still registered for `{}` after reinstalling", existing.to_string_lossy())]
    Conflict { existing: OsString },
    #[error("Service installation failure")]
    ServiceMissing,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("Service security descriptor is malformed")]
    Descriptor(#[from] ParseError),
    #[error("SetServiceObjectSecurity error: {}", .0.code())]
    SetSecurity(OsError),
    #[error("Services are only supported on Windows")]
    Unsupported,
}

impl InstallError {
    /// Failures on the service object itself as opposed to registering or removing it.
    pub fn is_installer_specific(&self) -> bool {
        match self {
            Self::ServiceMissing
            | Self::Locate(_)
            | Self::Query(_)
            | Self::Descriptor(_)
            | Self::SetSecurity(_) => true,
            Self::GrantDirectory { .. }
            | Self::NoInstallDir(_)
            | Self::Register(_)
            | Self::Open(_)
            | Self::QueryConfig(_)
            | Self::Delete(_)
            | Self::Conflict { .. }
            | Self::Unsupported => false,
        }
    }
}

/// Registers `executable` as the service.
///
/// Grants the service account full control over the executable's directory first.
pub fn install<M, F>(scm: &M, files: &F, executable: &Path) -> Result<InstallOutcome, InstallError>
where
    M: ServiceControlManager,
    F: FileSecurity + ?Sized,
{
    let install_dir = executable
        .parent()
        .ok_or_else(|| InstallError::NoInstallDir(executable.to_path_buf()))?;
    let rule = AccessRule::allow(Sid::local_service(), AccessRights::FULL_CONTROL)
        .inherited_by_children();
    dir_guard::grant_access(files, install_dir, &rule).map_err(|source| {
        InstallError::GrantDirectory {
            path: install_dir.to_path_buf(),
            source,
        }
    })?;

    register(scm, &ServiceSpec::for_executable(executable), true)
}

fn register<M>(
    scm: &M,
    spec: &ServiceSpec,
    may_reinstall: bool,
) -> Result<InstallOutcome, InstallError>
where
    M: ServiceControlManager,
{
    match scm.create(spec) {
        Ok(()) => {
            narrow_permissions(scm, spec.name)?;
            tracing::info!(executable = %spec.executable.display(), "Installed service");

            Ok(InstallOutcome::Installed)
        }
        Err(OsError(ERROR_SERVICE_EXISTS)) => {
            let existing = scm
                .open(spec.name)
                .map_err(InstallError::Open)?
                .ok_or(InstallError::ServiceMissing)?;
            let registered = existing
                .executable_path()
                .map_err(InstallError::QueryConfig)?;
            drop(existing);

            if is_same_executable(&registered, &spec.executable) {
                narrow_permissions(scm, spec.name)?;
                tracing::info!("Service is already installed");

                return Ok(InstallOutcome::AlreadyInstalled);
            }
            if !may_reinstall {
                return Err(InstallError::Conflict {
                    existing: registered,
                });
            }

            tracing::info!(
                registered = %registered.to_string_lossy(),
                "Service is registered for another executable, reinstalling"
            );
            uninstall(scm)?;
            register(scm, spec, false)?;

            Ok(InstallOutcome::Reinstalled)
        }
        Err(e) => Err(InstallError::Register(e)),
    }
}

/// Leaves interactive users with exactly [`AccessRights::SERVICE_USER_CONTROL`].
fn narrow_permissions<M>(scm: &M, name: &str) -> Result<(), InstallError>
where
    M: ServiceControlManager,
{
    let service = scm
        .open(name)
        .map_err(InstallError::Locate)?
        .ok_or(InstallError::ServiceMissing)?;

    let existing = query_two_pass("QueryServiceObjectSecurity", |buffer, needed| {
        service.query_security(buffer, needed)
    })?;
    let narrowed = narrow_service_access(
        &existing,
        &Sid::authenticated_users(),
        AccessRights::SERVICE_USER_CONTROL,
    )?;
    service
        .set_security(&narrowed)
        .map_err(InstallError::SetSecurity)?;

    Ok(())
}

/// Stops and removes the service. Not being installed counts as success.
pub fn uninstall<M>(scm: &M) -> Result<UninstallOutcome, InstallError>
where
    M: ServiceControlManager,
{
    let Some(service) = scm
        .open(bin_shared::SERVICE_NAME)
        .map_err(InstallError::Open)?
    else {
        tracing::info!("Service is not installed");
        return Ok(UninstallOutcome::NotInstalled);
    };

    match service.is_running() {
        Ok(false) => {}
        Ok(true) => match service.stop() {
            Ok(()) | Err(OsError(ERROR_SERVICE_NOT_ACTIVE)) => {
                tracing::info!("Stopped service");
            }
            Err(e) => tracing::warn!("Failed to stop service: {e}"),
        },
        Err(e) => tracing::warn!("Failed to query service status: {e}"),
    }

    match service.delete() {
        Ok(()) | Err(OsError(ERROR_SERVICE_MARKED_FOR_DELETE)) => {
            tracing::info!("Uninstalled service");
            Ok(UninstallOutcome::Removed)
        }
        Err(OsError(ERROR_SERVICE_DOES_NOT_EXIST)) => Ok(UninstallOutcome::NotInstalled),
        Err(e) => Err(InstallError::Delete(e)),
    }
}

/// Compares the registered binary path with ours.
///
/// The service manager may hand the path back quoted and, on Windows, with any casing.
fn is_same_executable(registered: &OsString, ours: &Path) -> bool {
    let registered = registered.to_string_lossy();
    let registered = registered.trim();
    let registered = match registered.strip_prefix('"') {
        Some(rest) => rest.split('"').next().unwrap_or(rest),
        None => registered,
    };
    let ours = ours.to_string_lossy();

    if cfg!(windows) {
        let normalise = |path: &str| path.replace('/', "\\").to_lowercase();
        normalise(registered) == normalise(&ours)
    } else {
        registered == ours
    }
}
