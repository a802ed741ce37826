//! In-memory stand-ins for the service manager and file ACLs.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bin_shared::win32::{ERROR_ACCESS_DENIED, ERROR_SERVICE_DOES_NOT_EXIST, ERROR_SERVICE_EXISTS};
use security_descriptor::{
    Ace, AceFlags, AccessRights, Acl, ERROR_INSUFFICIENT_BUFFER, OsError, SecurityDescriptor, Sid,
};

use crate::dir_guard::{FileSecurity, FileSecurityError};
use crate::installer::{ServiceControlManager, ServiceHandle, ServiceSpec};

/// Roughly what the service manager gives a freshly created service.
pub(crate) fn default_service_descriptor() -> Vec<u8> {
    let mut descriptor = SecurityDescriptor::new();
    descriptor.set_owner(Some(Sid::local_system()));
    descriptor.set_group(Some(Sid::local_system()));
    descriptor.set_dacl(Some(Acl::from_aces([
        Ace::allow(
            Sid::local_system(),
            AccessRights::SERVICE_ALL_ACCESS,
            AceFlags::empty(),
        ),
        Ace::allow(
            Sid::builtin_administrators(),
            AccessRights::SERVICE_ALL_ACCESS,
            AceFlags::empty(),
        ),
        Ace::allow(
            Sid::interactive(),
            AccessRights::QUERY_CONFIG
                | AccessRights::QUERY_STATUS
                | AccessRights::ENUMERATE_DEPENDENTS
                | AccessRights::INTERROGATE
                | AccessRights::USER_DEFINED_CONTROL
                | AccessRights::READ_CONTROL,
            AceFlags::empty(),
        ),
        Ace::allow(
            Sid::authenticated_users(),
            AccessRights::QUERY_CONFIG
                | AccessRights::QUERY_STATUS
                | AccessRights::INTERROGATE
                | AccessRights::USER_DEFINED_CONTROL
                | AccessRights::READ_CONTROL,
            AceFlags::empty(),
        ),
    ])));

    descriptor.to_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceRecord {
    pub(crate) executable: OsString,
    pub(crate) descriptor: Vec<u8>,
    pub(crate) running: bool,
}

#[derive(Debug, Default)]
struct ScmState {
    services: BTreeMap<String, ServiceRecord>,
    stops: usize,
    create_error: Option<u32>,
    open_error: Option<u32>,
    query_error: Option<u32>,
    set_security_error: Option<u32>,
    delete_error: Option<u32>,
    ignore_deletes: bool,
    forget_created: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeScm {
    state: Rc<RefCell<ScmState>>,
}

impl FakeScm {
    pub(crate) fn failing_create_with(self, code: u32) -> Self {
        self.state.borrow_mut().create_error = Some(code);
        self
    }

    pub(crate) fn failing_open_with(self, code: u32) -> Self {
        self.state.borrow_mut().open_error = Some(code);
        self
    }

    pub(crate) fn failing_query_with(self, code: u32) -> Self {
        self.state.borrow_mut().query_error = Some(code);
        self
    }

    pub(crate) fn failing_set_security_with(self, code: u32) -> Self {
        self.state.borrow_mut().set_security_error = Some(code);
        self
    }

    pub(crate) fn failing_delete_with(self, code: u32) -> Self {
        self.state.borrow_mut().delete_error = Some(code);
        self
    }

    /// `DeleteService` succeeds but the service stays registered.
    pub(crate) fn ignoring_deletes(self) -> Self {
        self.state.borrow_mut().ignore_deletes = true;
        self
    }

    /// `CreateService` succeeds but the service can't be opened afterwards.
    pub(crate) fn forgetting_created_services(self) -> Self {
        self.state.borrow_mut().forget_created = true;
        self
    }

    pub(crate) fn register(&self, name: &str, executable: OsString, descriptor: Vec<u8>) {
        self.state.borrow_mut().services.insert(
            name.to_owned(),
            ServiceRecord {
                executable,
                descriptor,
                running: false,
            },
        );
    }

    pub(crate) fn record(&self, name: &str) -> Option<ServiceRecord> {
        self.state.borrow().services.get(name).cloned()
    }

    pub(crate) fn service_count(&self) -> usize {
        self.state.borrow().services.len()
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.state.borrow().stops
    }

    pub(crate) fn set_running(&self, name: &str, running: bool) {
        if let Some(record) = self.state.borrow_mut().services.get_mut(name) {
            record.running = running;
        }
    }
}

impl ServiceControlManager for FakeScm {
    type Service = FakeService;

    fn create(&self, spec: &ServiceSpec) -> Result<(), OsError> {
        let mut state = self.state.borrow_mut();
        if let Some(code) = state.create_error {
            return Err(OsError(code));
        }
        if state.services.contains_key(spec.name) {
            return Err(OsError(ERROR_SERVICE_EXISTS));
        }
        if state.forget_created {
            return Ok(());
        }
        state.services.insert(
            spec.name.to_owned(),
            ServiceRecord {
                executable: spec.executable.clone().into_os_string(),
                descriptor: default_service_descriptor(),
                running: false,
            },
        );

        Ok(())
    }

    fn open(&self, name: &str) -> Result<Option<FakeService>, OsError> {
        if let Some(code) = self.state.borrow().open_error {
            return Err(OsError(code));
        }
        let exists = self.state.borrow().services.contains_key(name);

        Ok(exists.then(|| FakeService {
            state: Rc::clone(&self.state),
            name: name.to_owned(),
        }))
    }
}

pub(crate) struct FakeService {
    state: Rc<RefCell<ScmState>>,
    name: String,
}

impl FakeService {
    fn with_record<T>(&self, f: impl FnOnce(&mut ServiceRecord) -> T) -> Result<T, OsError> {
        let mut state = self.state.borrow_mut();
        let record = state
            .services
            .get_mut(&self.name)
            .ok_or(OsError(ERROR_SERVICE_DOES_NOT_EXIST))?;

        Ok(f(record))
    }
}

impl ServiceHandle for FakeService {
    fn executable_path(&self) -> Result<OsString, OsError> {
        self.with_record(|record| record.executable.clone())
    }

    fn is_running(&self) -> Result<bool, OsError> {
        self.with_record(|record| record.running)
    }

    fn stop(&self) -> Result<(), OsError> {
        self.with_record(|record| record.running = false)?;
        self.state.borrow_mut().stops += 1;

        Ok(())
    }

    fn delete(&self) -> Result<(), OsError> {
        let mut state = self.state.borrow_mut();
        if let Some(code) = state.delete_error {
            return Err(OsError(code));
        }
        if state.ignore_deletes {
            return Ok(());
        }
        state
            .services
            .remove(&self.name)
            .map(|_| ())
            .ok_or(OsError(ERROR_SERVICE_DOES_NOT_EXIST))
    }

    fn query_security(&self, buffer: &mut [u8], needed: &mut u32) -> Result<(), OsError> {
        if let Some(code) = self.state.borrow().query_error {
            return Err(OsError(code));
        }
        let descriptor = self.with_record(|record| record.descriptor.clone())?;

        *needed = descriptor.len() as u32;
        if buffer.len() < descriptor.len() {
            return Err(OsError(ERROR_INSUFFICIENT_BUFFER));
        }
        buffer[..descriptor.len()].copy_from_slice(&descriptor);

        Ok(())
    }

    fn set_security(&self, descriptor: &[u8]) -> Result<(), OsError> {
        if let Some(code) = self.state.borrow().set_security_error {
            return Err(OsError(code));
        }

        self.with_record(|record| record.descriptor = descriptor.to_vec())
    }
}

/// A file that was never written gets this descriptor: explicit rules, a protected DACL
/// and two inherited rules.
pub(crate) fn default_file_descriptor() -> SecurityDescriptor {
    let inherited = AceFlags::OBJECT_INHERIT | AceFlags::CONTAINER_INHERIT | AceFlags::INHERITED;

    let mut descriptor = SecurityDescriptor::new();
    descriptor.set_owner(Some(Sid::builtin_administrators()));
    descriptor.set_dacl(Some(Acl::from_aces([
        Ace::allow(Sid::world(), AccessRights::FULL_CONTROL, AceFlags::empty()),
        Ace::allow(
            Sid::interactive(),
            AccessRights::READ | AccessRights::EXECUTE,
            AceFlags::empty(),
        ),
        Ace::allow(Sid::local_system(), AccessRights::FULL_CONTROL, inherited),
        Ace::allow(
            Sid::builtin_administrators(),
            AccessRights::FULL_CONTROL,
            inherited,
        ),
    ])));
    descriptor.set_dacl_protected(true);

    descriptor
}

#[derive(Debug, Default)]
pub(crate) struct FakeFiles {
    written: RefCell<HashMap<PathBuf, SecurityDescriptor>>,
    writes: Cell<usize>,
    failing: Option<PathBuf>,
}

impl FakeFiles {
    pub(crate) fn failing_on(self, path: &Path) -> Self {
        Self {
            failing: Some(path.to_path_buf()),
            ..self
        }
    }

    pub(crate) fn written(&self, path: &Path) -> Option<SecurityDescriptor> {
        self.written.borrow().get(path).cloned()
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.get()
    }
}

impl FileSecurity for FakeFiles {
    fn read(&self, path: &Path) -> Result<SecurityDescriptor, FileSecurityError> {
        if self.failing.as_deref() == Some(path) {
            return Err(FileSecurityError::Read(ERROR_ACCESS_DENIED));
        }
        // Like opening with `FILE_FLAG_OPEN_REPARSE_POINT`: the link itself must exist.
        if std::fs::symlink_metadata(path).is_err() {
            return Err(FileSecurityError::Open(2));
        }

        Ok(self
            .written
            .borrow()
            .get(path)
            .cloned()
            .unwrap_or_else(default_file_descriptor))
    }

    fn write(&self, path: &Path, descriptor: &SecurityDescriptor) -> Result<(), FileSecurityError> {
        if self.failing.as_deref() == Some(path) {
            return Err(FileSecurityError::Write(ERROR_ACCESS_DENIED));
        }
        self.written
            .borrow_mut()
            .insert(path.to_path_buf(), descriptor.clone());
        self.writes.set(self.writes.get() + 1);

        Ok(())
    }
}
