use std::path::Path;

use anyhow::{Result, bail};
use security_descriptor::{SecurityDescriptor, Sid};

use super::{FileSecurity, FileSecurityError};

/// Unix permissions aren't ACLs, the directory guard only runs on Windows.
#[derive(Debug, Default)]
pub struct NativeFileSecurity;

impl FileSecurity for NativeFileSecurity {
    fn read(&self, _: &Path) -> Result<SecurityDescriptor, FileSecurityError> {
        Err(FileSecurityError::Unsupported)
    }

    fn write(&self, _: &Path, _: &SecurityDescriptor) -> Result<(), FileSecurityError> {
        Err(FileSecurityError::Unsupported)
    }
}

pub fn current_user_sid() -> Result<Sid> {
    bail!("Users have no SID on this platform")
}
