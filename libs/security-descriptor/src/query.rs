//! The size-then-fetch protocol of Win32 APIs that fill caller-provided buffers.

/// `ERROR_INSUFFICIENT_BUFFER`
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

/// A raw Win32 error code, as returned by `GetLastError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("OS error {0}")]
pub struct OsError(pub u32);

impl OsError {
    pub fn code(self) -> u32 {
        self.0
    }
}

/// A failed call during [`query_two_pass`].
///
/// Renders as e.g. `QueryServiceObjectSecurity[1] error: 5`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{api}[{pass}] error: {code}")]
pub struct QueryError {
    pub api: &'static str,
    /// 1 for the sizing call, 2 for the fetching call.
    pub pass: u8,
    pub code: u32,
}

/// Calls `call` once with an empty buffer to learn the required size, then again with a buffer of that size.
///
/// `call` gets the buffer and an out-parameter for the number of bytes needed.
/// A first call that succeeds means there's nothing to fetch and yields an empty buffer.
/// The only error code tolerated on the first call is [`ERROR_INSUFFICIENT_BUFFER`].
pub fn query_two_pass<F>(api: &'static str, mut call: F) -> Result<Vec<u8>, QueryError>
where
    F: FnMut(&mut [u8], &mut u32) -> Result<(), OsError>,
{
    let mut needed = 0u32;

    match call(&mut [], &mut needed) {
        Ok(()) => return Ok(Vec::new()),
        Err(OsError(ERROR_INSUFFICIENT_BUFFER)) => {}
        Err(OsError(code)) => {
            return Err(QueryError {
                api,
                pass: 1,
                code,
            });
        }
    }

    let mut buffer = vec![0u8; needed as usize];
    call(&mut buffer, &mut needed).map_err(|OsError(code)| QueryError {
        api,
        pass: 2,
        code,
    })?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const API: &str = "QueryServiceObjectSecurity";

    #[test]
    fn fetches_with_the_reported_size() {
        let data = [1u8, 2, 3, 4, 5];
        let mut calls = Vec::new();

        let buffer = query_two_pass(API, |buf, needed| {
            calls.push(buf.len());
            if buf.len() < data.len() {
                *needed = data.len() as u32;
                return Err(OsError(ERROR_INSUFFICIENT_BUFFER));
            }
            buf.copy_from_slice(&data);
            Ok(())
        })
        .unwrap();

        assert_eq!(buffer, data);
        assert_eq!(calls, [0, 5]);
    }

    #[test]
    fn first_pass_success_means_empty() {
        let buffer = query_two_pass(API, |_, _| Ok(())).unwrap();

        assert!(buffer.is_empty());
    }

    #[test]
    fn unexpected_first_pass_code_is_reported_verbatim() {
        let mut calls = 0;

        let err = query_two_pass(API, |_, _| {
            calls += 1;
            Err(OsError(5))
        })
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.to_string(), "QueryServiceObjectSecurity[1] error: 5");
    }

    #[test]
    fn second_pass_failure_is_reported_with_its_own_code() {
        let err = query_two_pass(API, |buf, needed| {
            if buf.is_empty() {
                *needed = 64;
                Err(OsError(ERROR_INSUFFICIENT_BUFFER))
            } else {
                Err(OsError(6))
            }
        })
        .unwrap_err();

        assert_eq!(
            err,
            QueryError {
                api: API,
                pass: 2,
                code: 6
            }
        );
        assert_eq!(err.to_string(), "QueryServiceObjectSecurity[2] error: 6");
    }
}
