use std::ffi::OsString;

use security_descriptor::OsError;

use super::{InstallError, ServiceControlManager, ServiceHandle, ServiceSpec};

/// Unix service managers are configured with unit files shipped by the package instead.
#[derive(Debug)]
pub struct SystemServiceManager(Unsupported);

#[derive(Debug)]
pub enum Unsupported {}

impl SystemServiceManager {
    pub fn connect() -> Result<Self, InstallError> {
        Err(InstallError::Unsupported)
    }
}

impl ServiceControlManager for SystemServiceManager {
    type Service = Unsupported;

    fn create(&self, _: &ServiceSpec) -> Result<(), OsError> {
        match self.0 {}
    }

    fn open(&self, _: &str) -> Result<Option<Unsupported>, OsError> {
        match self.0 {}
    }
}

impl ServiceHandle for Unsupported {
    fn executable_path(&self) -> Result<OsString, OsError> {
        match *self {}
    }

    fn is_running(&self) -> Result<bool, OsError> {
        match *self {}
    }

    fn stop(&self) -> Result<(), OsError> {
        match *self {}
    }

    fn delete(&self) -> Result<(), OsError> {
        match *self {}
    }

    fn query_security(&self, _: &mut [u8], _: &mut u32) -> Result<(), OsError> {
        match *self {}
    }

    fn set_security(&self, _: &[u8]) -> Result<(), OsError> {
        match *self {}
    }
}
