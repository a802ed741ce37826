use anyhow::{Context as _, Result};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, GetLastError, HANDLE,
};
use windows::Win32::System::Threading::CreateMutexW;
use windows::core::HSTRING;

/// A named mutex in the `Global\` namespace.
///
/// The service runs in session 0 and a `--daemon` in the user's session, so a per-session
/// name would let both run at once.
#[derive(Debug)]
pub(crate) struct Lock {
    handle: HANDLE,
}

// SAFETY: Mutex handles may be closed from any thread.
unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Lock {
    pub(crate) fn acquire(name: &str) -> Result<Option<Self>> {
        let name = HSTRING::from(format!(r"Global\{name}"));

        // SAFETY: `name` outlives the call.
        let handle = match unsafe { CreateMutexW(None, true, &name) } {
            Ok(handle) => handle,
            // The service account created it and our user may not open it, so it exists.
            Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => return Ok(None),
            Err(e) => return Err(e).context("CreateMutexW failed"),
        };

        // SAFETY: Reads thread-local state set by `CreateMutexW` just above.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            // SAFETY: We own this handle and don't use it afterwards.
            unsafe { CloseHandle(handle) }.context("CloseHandle failed")?;
            return Ok(None);
        }

        Ok(Some(Self { handle }))
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        // SAFETY: We own the handle and nobody else closes it.
        if let Err(error) = unsafe { CloseHandle(self.handle) } {
            tracing::error!("Failed to close instance lock: {error}");
        }
    }
}
