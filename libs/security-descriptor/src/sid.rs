use std::{fmt, str::FromStr};

use crate::{ParseError, read_u32, take};

const SID_REVISION: u8 = 1;
const MAX_SUB_AUTHORITIES: usize = 15;

const NT_AUTHORITY: u64 = 5;
const WORLD_AUTHORITY: u64 = 1;

/// A security identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid {
    authority: [u8; 6],
    sub_authorities: Vec<u32>,
}

impl Sid {
    /// Creates a SID from a 48-bit identifier authority and its sub-authorities.
    ///
    /// Bits above the 48th of `authority` are discarded.
    /// Callers must not pass more than 15 sub-authorities, the extras are dropped.
    pub fn new(authority: u64, sub_authorities: &[u32]) -> Self {
        let be = authority.to_be_bytes();
        let mut authority = [0u8; 6];
        authority.copy_from_slice(&be[2..]);

        Self {
            authority,
            sub_authorities: sub_authorities
                .iter()
                .take(MAX_SUB_AUTHORITIES)
                .copied()
                .collect(),
        }
    }

    /// `NT AUTHORITY\LocalService`, the account the service runs under.
    pub fn local_service() -> Self {
        Self::new(NT_AUTHORITY, &[19])
    }

    /// `NT AUTHORITY\SYSTEM`
    pub fn local_system() -> Self {
        Self::new(NT_AUTHORITY, &[18])
    }

    /// `NT AUTHORITY\Authenticated Users`, the principal that may control the service.
    pub fn authenticated_users() -> Self {
        Self::new(NT_AUTHORITY, &[11])
    }

    /// `NT AUTHORITY\INTERACTIVE`
    pub fn interactive() -> Self {
        Self::new(NT_AUTHORITY, &[4])
    }

    /// `BUILTIN\Administrators`
    pub fn builtin_administrators() -> Self {
        Self::new(NT_AUTHORITY, &[32, 544])
    }

    /// `Everyone`
    pub fn world() -> Self {
        Self::new(WORLD_AUTHORITY, &[0])
    }

    pub fn authority(&self) -> u64 {
        self.authority
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn sub_authorities(&self) -> &[u32] {
        &self.sub_authorities
    }

    /// Length of the binary form in bytes.
    pub fn encoded_len(&self) -> usize {
        8 + 4 * self.sub_authorities.len()
    }

    /// Decodes a SID from the front of `bytes`, returning it and the number of bytes consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), ParseError> {
        let header = take(bytes, 0, 8, "SID header")?;

        let revision = header[0];
        if revision != SID_REVISION {
            return Err(ParseError::SidRevision(revision));
        }

        let count = header[1];
        if usize::from(count) > MAX_SUB_AUTHORITIES {
            return Err(ParseError::TooManySubAuthorities(count));
        }

        let mut authority = [0u8; 6];
        authority.copy_from_slice(&header[2..8]);

        let sub_authorities = (0..usize::from(count))
            .map(|i| read_u32(bytes, 8 + 4 * i, "SID sub-authority"))
            .collect::<Result<Vec<_>, _>>()?;

        let sid = Self {
            authority,
            sub_authorities,
        };
        let len = sid.encoded_len();

        Ok((sid, len))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::parse(bytes).map(|(sid, _)| sid)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(SID_REVISION);
        out.push(self.sub_authorities.len() as u8); // At most 15, see `new` and `parse`.
        out.extend_from_slice(&self.authority);
        for sub in &self.sub_authorities {
            out.extend_from_slice(&sub.to_le_bytes());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out);

        out
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let authority = self.authority();

        // Same rendering as `ConvertSidToStringSidW`.
        if authority >> 32 == 0 {
            write!(f, "S-{SID_REVISION}-{authority}")?;
        } else {
            write!(f, "S-{SID_REVISION}-0x{authority:012X}")?;
        }

        for sub in &self.sub_authorities {
            write!(f, "-{sub}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Sid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::SidString(s.to_owned());

        let mut parts = s.split('-');

        if !parts.next().is_some_and(|p| p.eq_ignore_ascii_case("S")) {
            return Err(invalid());
        }
        if parts.next() != Some("1") {
            return Err(invalid());
        }

        let authority = parts.next().ok_or_else(invalid)?;
        let authority = match authority
            .strip_prefix("0x")
            .or_else(|| authority.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16).map_err(|_| invalid())?,
            None => authority.parse::<u64>().map_err(|_| invalid())?,
        };
        if authority >> 48 != 0 {
            return Err(invalid());
        }

        let sub_authorities = parts
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        if sub_authorities.len() > MAX_SUB_AUTHORITIES {
            return Err(invalid());
        }

        Ok(Self::new(authority, &sub_authorities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Sid::local_service(), "S-1-5-19")]
    #[test_case(Sid::local_system(), "S-1-5-18")]
    #[test_case(Sid::authenticated_users(), "S-1-5-11")]
    #[test_case(Sid::interactive(), "S-1-5-4")]
    #[test_case(Sid::builtin_administrators(), "S-1-5-32-544")]
    #[test_case(Sid::world(), "S-1-1-0")]
    fn well_known_sids(sid: Sid, expected: &str) {
        assert_eq!(sid.to_string(), expected);
        assert_eq!(expected.parse::<Sid>().unwrap(), sid);
    }

    #[test]
    fn binary_layout() {
        let bytes = Sid::builtin_administrators().to_bytes();

        assert_eq!(
            bytes,
            [
                1, 2, 0, 0, 0, 0, 0, 5, // revision, count, authority
                32, 0, 0, 0, // BUILTIN
                0x20, 0x02, 0, 0, // 544
            ]
        );
    }

    #[test]
    fn parse_reports_consumed_length_and_ignores_trailing_bytes() {
        let mut bytes = Sid::local_service().to_bytes();
        bytes.extend_from_slice(&[0xAA, 0xBB]);

        let (sid, len) = Sid::parse(&bytes).unwrap();

        assert_eq!(sid, Sid::local_service());
        assert_eq!(len, 12);
    }

    #[test]
    fn user_sid_round_trips_through_string() {
        let s = "S-1-5-21-3623811015-3361044348-30300820-1013";

        let sid = s.parse::<Sid>().unwrap();

        assert_eq!(sid.sub_authorities().len(), 5);
        assert_eq!(sid.to_string(), s);
        assert_eq!(Sid::from_bytes(&sid.to_bytes()).unwrap(), sid);
    }

    #[test]
    fn large_authority_renders_as_hex() {
        let sid = Sid::new(0x0000_1234_5678_9ABC, &[7]);

        assert_eq!(sid.to_string(), "S-1-0x123456789ABC-7");
        assert_eq!(sid.to_string().parse::<Sid>().unwrap(), sid);
    }

    #[test]
    fn truncated_sid_is_rejected() {
        let bytes = Sid::builtin_administrators().to_bytes();

        let err = Sid::parse(&bytes[..13]).unwrap_err();

        assert!(matches!(err, ParseError::Truncated { .. }), "{err}");
    }

    #[test]
    fn bad_revision_is_rejected() {
        let mut bytes = Sid::local_system().to_bytes();
        bytes[0] = 2;

        assert_eq!(Sid::parse(&bytes).unwrap_err(), ParseError::SidRevision(2));
    }

    #[test_case("S-1")]
    #[test_case("X-1-5-18")]
    #[test_case("S-2-5-18")]
    #[test_case("S-1-5-abc")]
    #[test_case("S-1-0x1000000000000-1")]
    fn malformed_strings_are_rejected(s: &str) {
        assert!(s.parse::<Sid>().is_err());
    }
}
