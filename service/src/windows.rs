//! Small helpers for talking to Win32 security APIs.

use std::ffi::c_void;

use security_descriptor::OsError;
use windows::Win32::Foundation::WIN32_ERROR;

/// The Win32 error code behind a `windows` error, or the raw `HRESULT` if it isn't one.
pub(crate) fn os_error(e: &windows::core::Error) -> OsError {
    OsError(WIN32_ERROR::from_error(e).map_or(e.code().0 as u32, |code| code.0))
}

/// A copy of a self-relative security descriptor or ACL with the alignment Win32 expects.
///
/// Buffers from `Vec<u8>` are only byte aligned.
pub(crate) struct AlignedBytes {
    words: Vec<u64>,
}

impl AlignedBytes {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        let mut words = vec![0u64; bytes.len().div_ceil(8)];
        // SAFETY: `words` is at least `bytes.len()` bytes long and the two don't overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                words.as_mut_ptr().cast::<u8>(),
                bytes.len(),
            );
        }

        Self { words }
    }

    pub(crate) fn as_ptr(&self) -> *const c_void {
        self.words.as_ptr().cast()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr().cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_bytes_are_aligned_and_equal() {
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];

        let aligned = AlignedBytes::new(&bytes);

        assert_eq!(aligned.as_ptr() as usize % 8, 0);
        // SAFETY: `aligned` holds at least `bytes.len()` initialised bytes.
        let copy = unsafe { std::slice::from_raw_parts(aligned.as_ptr().cast::<u8>(), bytes.len()) };
        assert_eq!(copy, bytes);
    }
}
