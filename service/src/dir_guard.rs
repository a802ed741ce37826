//! Hands the working directory over to a new owner.
//!
//! After install the service account owns `<install dir>/data`, after uninstall the user
//! who ran the uninstaller does. Every explicit rule below the directory is removed so
//! the new owner's rule on the root is the only one that matters.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use security_descriptor::{
    AccessRights, AccessRule, ParseError, SecurityDescriptor, Sid, set_access, strip_explicit,
};

#[cfg(unix)]
#[path = "dir_guard/unix.rs"]
mod platform;

#[cfg(windows)]
#[path = "dir_guard/windows.rs"]
mod platform;

pub use platform::{NativeFileSecurity, current_user_sid};

/// Reads and writes the DACL of a file or directory.
///
/// Implementations must not follow symbolic links: the descriptor of the link itself is
/// read and written.
pub trait FileSecurity {
    fn read(&self, path: &Path) -> Result<SecurityDescriptor, FileSecurityError>;

    /// Writes the DACL of `descriptor` and its protection flag. Owner, group and SACL are ignored.
    fn write(&self, path: &Path, descriptor: &SecurityDescriptor) -> Result<(), FileSecurityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FileSecurityError {
    #[error("CreateFileW error: {0}")]
    Open(u32),
    #[error("GetSecurityInfo error: {0}")]
    Read(u32),
    #[error("SetSecurityInfo error: {0}")]
    Write(u32),
    #[error("Malformed security descriptor")]
    Parse(#[from] ParseError),
    #[error("File ACLs are only supported on Windows")]
    Unsupported,
}

#[derive(Debug, thiserror::Error)]
pub enum AclResetError {
    #[error("Failed to list `{}`", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to reset the ACL of `{}`", path.display())]
    Reset {
        path: PathBuf,
        #[source]
        source: FileSecurityError,
    },
}

/// Adds `rule` to the DACL of `path`, replacing earlier explicit rules of the same trustee.
pub fn grant_access<F>(files: &F, path: &Path, rule: &AccessRule) -> Result<(), FileSecurityError>
where
    F: FileSecurity + ?Sized,
{
    let mut descriptor = files.read(path)?;
    set_access(&mut descriptor, rule);
    files.write(path, &descriptor)
}

/// Makes `owner` the only principal with an explicit rule in `dir` and below.
///
/// A missing `dir` is fine. The first failure aborts the walk.
pub fn reset_ownership<F>(files: &F, dir: &Path, owner: &Sid) -> Result<(), AclResetError>
where
    F: FileSecurity + ?Sized,
{
    match fs::symlink_metadata(dir) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "Nothing to reset");
            return Ok(());
        }
        Err(source) => {
            return Err(AclResetError::List {
                path: dir.to_path_buf(),
                source,
            });
        }
    }

    let root_rule =
        AccessRule::allow(owner.clone(), AccessRights::FULL_CONTROL).inherited_by_children();
    reset_entry(files, dir, Some(&root_rule))?;
    reset_children(files, dir)?;

    tracing::info!(dir = %dir.display(), %owner, "Reset working directory ACL");

    Ok(())
}

fn reset_children<F>(files: &F, dir: &Path) -> Result<(), AclResetError>
where
    F: FileSecurity + ?Sized,
{
    let list_error = |source| AclResetError::List {
        path: dir.to_path_buf(),
        source,
    };

    for entry in fs::read_dir(dir).map_err(list_error)? {
        let entry = entry.map_err(list_error)?;
        let file_type = entry.file_type().map_err(list_error)?;
        let path = entry.path();

        reset_entry(files, &path, None)?;

        // Links are reset like files but never followed.
        if file_type.is_dir() && !file_type.is_symlink() {
            reset_children(files, &path)?;
        }
    }

    Ok(())
}

/// Strips explicit rules and adds `grant` in the same write.
fn reset_entry<F>(files: &F, path: &Path, grant: Option<&AccessRule>) -> Result<(), AclResetError>
where
    F: FileSecurity + ?Sized,
{
    let reset_error = |source| AclResetError::Reset {
        path: path.to_path_buf(),
        source,
    };

    let mut descriptor = files.read(path).map_err(reset_error)?;
    strip_explicit(&mut descriptor);
    if let Some(rule) = grant {
        set_access(&mut descriptor, rule);
    }
    files.write(path, &descriptor).map_err(reset_error)?;

    tracing::trace!(path = %path.display(), "Reset ACL");

    Ok(())
}
