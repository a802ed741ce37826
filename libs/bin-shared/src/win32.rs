//! Win32 error codes we branch on.
//!
//! Kept as plain `u32`s, as returned by `GetLastError`, so that platform-independent
//! code (and its tests) can match on them without pulling in the `windows` crate.
//! For details, see the System Error Codes reference:
//! <https://learn.microsoft.com/en-us/windows/win32/debug/system-error-codes>.

pub const ERROR_ACCESS_DENIED: u32 = 5;

pub const ERROR_SERVICE_DOES_NOT_EXIST: u32 = 1060;

pub const ERROR_SERVICE_NOT_ACTIVE: u32 = 1062;

/// `StartServiceCtrlDispatcherW` was called by a process the SCM didn't start.
pub const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: u32 = 1063;

pub const ERROR_SERVICE_MARKED_FOR_DELETE: u32 = 1072;

pub const ERROR_SERVICE_EXISTS: u32 = 1073;
