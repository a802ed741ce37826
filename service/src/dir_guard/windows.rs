use std::ffi::c_void;
use std::path::Path;

use anyhow::{Context as _, Result};
use security_descriptor::{AccessRights, SecurityDescriptor, Sid, query_two_pass};
use windows::Win32::Foundation::{CloseHandle, ERROR_SUCCESS, HANDLE, HLOCAL, LocalFree};
use windows::Win32::Security::Authorization::{GetSecurityInfo, SE_FILE_OBJECT, SetSecurityInfo};
use windows::Win32::Security::{
    ACL, DACL_SECURITY_INFORMATION, GetLengthSid, GetSecurityDescriptorLength,
    GetTokenInformation, PROTECTED_DACL_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR, TOKEN_QUERY,
    TOKEN_USER, TokenUser, UNPROTECTED_DACL_SECURITY_INFORMATION,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OPEN_REPARSE_POINT, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows::core::HSTRING;

use super::{FileSecurity, FileSecurityError};
use crate::windows::{AlignedBytes, os_error};

/// Works on handles opened with `FILE_FLAG_OPEN_REPARSE_POINT`, so links are never followed.
#[derive(Debug, Default)]
pub struct NativeFileSecurity;

impl FileSecurity for NativeFileSecurity {
    fn read(&self, path: &Path) -> Result<SecurityDescriptor, FileSecurityError> {
        let file = OwnedHandle::open(path)?;
        let mut raw = PSECURITY_DESCRIPTOR::default();

        // SAFETY: `file` is open with `READ_CONTROL`, `raw` receives a `LocalAlloc`ed buffer.
        let code = unsafe {
            GetSecurityInfo(
                file.0,
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION,
                None,
                None,
                None,
                None,
                Some(&mut raw),
            )
        };
        if code != ERROR_SUCCESS {
            return Err(FileSecurityError::Read(code.0));
        }

        // SAFETY: `raw` is a valid self-relative descriptor until we free it below.
        let bytes = unsafe {
            let len = GetSecurityDescriptorLength(raw) as usize;
            std::slice::from_raw_parts(raw.0.cast::<u8>(), len).to_vec()
        };
        // SAFETY: We own the buffer and don't use `raw` afterwards.
        unsafe { LocalFree(Some(HLOCAL(raw.0))) };

        Ok(SecurityDescriptor::from_bytes(&bytes)?)
    }

    fn write(&self, path: &Path, descriptor: &SecurityDescriptor) -> Result<(), FileSecurityError> {
        let file = OwnedHandle::open(path)?;
        let protection = if descriptor.is_dacl_protected() {
            PROTECTED_DACL_SECURITY_INFORMATION
        } else {
            UNPROTECTED_DACL_SECURITY_INFORMATION
        };
        let dacl = descriptor
            .dacl()
            .map(|dacl| AlignedBytes::new(&dacl.to_bytes()));

        // SAFETY: `dacl` is a well-formed ACL that outlives the call, `file` is open with `WRITE_DAC`.
        let code = unsafe {
            SetSecurityInfo(
                file.0,
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION | protection,
                None,
                None,
                dacl.as_ref().map(|dacl| dacl.as_ptr().cast::<ACL>()),
                None,
            )
        };
        if code != ERROR_SUCCESS {
            return Err(FileSecurityError::Write(code.0));
        }

        Ok(())
    }
}

struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn open(path: &Path) -> Result<Self, FileSecurityError> {
        let access = AccessRights::READ_CONTROL | AccessRights::WRITE_DAC;

        // SAFETY: The path is copied into an `HSTRING` that outlives the call.
        let handle = unsafe {
            CreateFileW(
                &HSTRING::from(path),
                access.bits(),
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OPEN_REPARSE_POINT,
                None,
            )
        }
        .map_err(|e| FileSecurityError::Open(os_error(&e).code()))?;

        Ok(Self(handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: We own the handle.
        if let Err(error) = unsafe { CloseHandle(self.0) } {
            tracing::warn!("Failed to close file handle: {error}");
        }
    }
}

/// The user this process runs as, taken from its token.
pub fn current_user_sid() -> Result<Sid> {
    let token = ProcessToken::our_process().context("Failed to get process token")?;

    token.user()
}

struct ProcessToken {
    inner: HANDLE,
}

impl ProcessToken {
    fn our_process() -> Result<Self> {
        // SAFETY: `GetCurrentProcess` returns a pseudo-handle which does not need to be closed.
        let our_proc = unsafe { GetCurrentProcess() };
        let mut inner = HANDLE::default();
        // SAFETY: If `OpenProcessToken` fails, there is no handle to close.
        unsafe { OpenProcessToken(our_proc, TOKEN_QUERY, &mut inner) }
            .context("`OpenProcessToken` failed")?;

        Ok(Self { inner })
    }

    fn user(&self) -> Result<Sid> {
        let buffer = query_two_pass("GetTokenInformation", |buf, needed| {
            let out = (!buf.is_empty()).then(|| buf.as_mut_ptr().cast::<c_void>());

            // SAFETY: `out` is either null or points to `buf.len()` writable bytes.
            unsafe { GetTokenInformation(self.inner, TokenUser, out, buf.len() as u32, needed) }
                .map_err(|e| os_error(&e))
        })?;
        anyhow::ensure!(
            buffer.len() >= size_of::<TOKEN_USER>(),
            "`TOKEN_USER` is truncated"
        );

        // SAFETY: The buffer starts with a `TOKEN_USER` whose SID points into the same buffer.
        let sid = unsafe {
            let token_user = buffer.as_ptr().cast::<TOKEN_USER>().read_unaligned();
            let sid = token_user.User.Sid;
            std::slice::from_raw_parts(sid.0.cast::<u8>(), GetLengthSid(sid) as usize).to_vec()
        };

        Ok(Sid::from_bytes(&sid)?)
    }
}

impl Drop for ProcessToken {
    fn drop(&mut self) {
        // SAFETY: We got `inner` from `OpenProcessToken` and didn't mutate it after that.
        if let Err(error) = unsafe { CloseHandle(self.inner) } {
            tracing::warn!("Failed to close process token: {error}");
        }
        self.inner = HANDLE::default();
    }
}
