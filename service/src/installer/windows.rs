use std::ffi::{OsStr, OsString};

use bin_shared::win32::ERROR_SERVICE_DOES_NOT_EXIST;
use security_descriptor::OsError;
use windows::Win32::Security::{DACL_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR};
use windows::Win32::System::Services::{
    QueryServiceObjectSecurity, SC_HANDLE, SetServiceObjectSecurity,
};
use windows_service::service::{
    Service, ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceState,
    ServiceType,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

use super::{InstallError, ServiceControlManager, ServiceHandle, ServiceSpec};
use crate::windows::{AlignedBytes, os_error};

const SERVICE_ACCOUNT: &str = r"NT AUTHORITY\LocalService";

/// `ERROR_INVALID_PARAMETER`, for `windows-service` errors that aren't from the OS.
const ERROR_INVALID_PARAMETER: u32 = 87;

pub struct SystemServiceManager {
    inner: ServiceManager,
}

impl SystemServiceManager {
    pub fn connect() -> Result<Self, InstallError> {
        let access = ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE;
        let inner = ServiceManager::local_computer(None::<&str>, access)
            .map_err(|e| InstallError::Open(scm_error(&e)))?;

        Ok(Self { inner })
    }
}

impl ServiceControlManager for SystemServiceManager {
    type Service = SystemService;

    fn create(&self, spec: &ServiceSpec) -> Result<(), OsError> {
        let info = ServiceInfo {
            name: OsString::from(spec.name),
            display_name: OsString::from(spec.display_name),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: spec.executable.clone(),
            launch_arguments: vec![],
            dependencies: vec![],
            account_name: Some(OsString::from(SERVICE_ACCOUNT)),
            account_password: None,
        };
        let service = self
            .inner
            .create_service(&info, ServiceAccess::CHANGE_CONFIG)
            .map_err(|e| scm_error(&e))?;
        service
            .set_description(spec.description)
            .map_err(|e| scm_error(&e))?;

        Ok(())
    }

    fn open(&self, name: &str) -> Result<Option<SystemService>, OsError> {
        // `READ_CONTROL` and `WRITE_DAC` for the service object's descriptor.
        let access = ServiceAccess::QUERY_CONFIG
            | ServiceAccess::QUERY_STATUS
            | ServiceAccess::STOP
            | ServiceAccess::DELETE
            | ServiceAccess::from_bits_retain(0x0002_0000 | 0x0004_0000);

        match self.inner.open_service(OsStr::new(name), access) {
            Ok(inner) => Ok(Some(SystemService { inner })),
            Err(e) => match scm_error(&e) {
                OsError(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(None),
                other => Err(other),
            },
        }
    }
}

pub struct SystemService {
    inner: Service,
}

impl SystemService {
    fn handle(&self) -> SC_HANDLE {
        SC_HANDLE(self.inner.raw_handle() as _)
    }
}

impl ServiceHandle for SystemService {
    fn executable_path(&self) -> Result<OsString, OsError> {
        let config = self.inner.query_config().map_err(|e| scm_error(&e))?;

        Ok(config.executable_path.into_os_string())
    }

    fn is_running(&self) -> Result<bool, OsError> {
        let status = self.inner.query_status().map_err(|e| scm_error(&e))?;

        Ok(status.current_state != ServiceState::Stopped)
    }

    fn stop(&self) -> Result<(), OsError> {
        self.inner.stop().map_err(|e| scm_error(&e))?;

        Ok(())
    }

    fn delete(&self) -> Result<(), OsError> {
        self.inner.delete().map_err(|e| scm_error(&e))
    }

    fn query_security(&self, buffer: &mut [u8], needed: &mut u32) -> Result<(), OsError> {
        let descriptor = PSECURITY_DESCRIPTOR(buffer.as_mut_ptr().cast());

        // SAFETY: `buffer` is writable for `buffer.len()` bytes and the handle is open with `READ_CONTROL`.
        unsafe {
            QueryServiceObjectSecurity(
                self.handle(),
                DACL_SECURITY_INFORMATION.0,
                descriptor,
                buffer.len() as u32,
                needed,
            )
        }
        .map_err(|e| os_error(&e))
    }

    fn set_security(&self, descriptor: &[u8]) -> Result<(), OsError> {
        let mut aligned = AlignedBytes::new(descriptor);

        // SAFETY: `aligned` holds a self-relative descriptor and outlives the call.
        unsafe {
            SetServiceObjectSecurity(
                self.handle(),
                DACL_SECURITY_INFORMATION,
                PSECURITY_DESCRIPTOR(aligned.as_mut_ptr()),
            )
        }
        .map_err(|e| os_error(&e))
    }
}

fn scm_error(e: &windows_service::Error) -> OsError {
    if let windows_service::Error::Winapi(io) = e {
        OsError(io.raw_os_error().unwrap_or_default() as u32)
    } else {
        OsError(ERROR_INVALID_PARAMETER)
    }
}
