//! Typed model of self-relative Windows security descriptors.
//!
//! Nothing in here calls into the OS. Descriptors come in as the bytes that
//! `QueryServiceObjectSecurity` / `GetNamedSecurityInfoW` hand out and leave as
//! the bytes the matching setters expect. Parsing keeps everything it does not
//! understand (unknown ACE types, slack space, component order) so that a
//! descriptor we did not edit serialises back to the exact input.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod ace;
mod acl;
mod descriptor;
mod edit;
mod query;
mod rights;
mod sid;

pub use ace::{Ace, AceBody, AceFlags, AceType};
pub use acl::Acl;
pub use descriptor::{Control, SecurityDescriptor};
pub use edit::{
    AccessRule, Effect, Inheritance, build_exclusive_access, narrow_service_access, set_access,
    strip_explicit,
};
pub use query::{ERROR_INSUFFICIENT_BUFFER, OsError, QueryError, query_two_pass};
pub use rights::AccessRights;
pub use sid::Sid;

/// Failure to decode one of the binary security structures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Truncated {what}: need {needed} bytes but only {available} are left")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("Unsupported SID revision {0}")]
    SidRevision(u8),
    #[error("SID has {0} sub-authorities, at most 15 are allowed")]
    TooManySubAuthorities(u8),
    #[error("Invalid SID string `{0}`")]
    SidString(String),
    #[error("ACE declares a size of {0} bytes which cannot hold its header")]
    AceSize(u16),
    #[error("ACL declares a size of {0} bytes which cannot hold its header")]
    AclSize(u16),
    #[error("Unsupported security descriptor revision {0}")]
    DescriptorRevision(u8),
    #[error("Security descriptor is not in self-relative form")]
    NotSelfRelative,
    #[error("{what} at offset {offset} overlaps another component")]
    Overlap { what: &'static str, offset: usize },
}

/// Bounds-checked slicing that reports what we were trying to read.
pub(crate) fn take<'a>(
    bytes: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], ParseError> {
    let available = bytes.len().saturating_sub(offset);

    bytes
        .get(offset..offset.saturating_add(len))
        .filter(|s| s.len() == len)
        .ok_or(ParseError::Truncated {
            what,
            needed: len,
            available,
        })
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize, what: &'static str) -> Result<u16, ParseError> {
    let b = take(bytes, offset, 2, what)?;

    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize, what: &'static str) -> Result<u32, ParseError> {
    let b = take(bytes, offset, 4, what)?;

    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
