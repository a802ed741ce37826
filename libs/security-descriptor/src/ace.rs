use bitflags::bitflags;

use crate::{AccessRights, ParseError, Sid, read_u16, read_u32, take};

const ACE_HEADER_LEN: usize = 4;

/// The ACE types whose body is an access mask followed by a SID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AceType {
    AccessAllowed = 0,
    AccessDenied = 1,
    SystemAudit = 2,
    SystemAlarm = 3,
}

impl AceType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::AccessAllowed),
            1 => Some(Self::AccessDenied),
            2 => Some(Self::SystemAudit),
            3 => Some(Self::SystemAlarm),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AceFlags: u8 {
        const OBJECT_INHERIT = 0x01;
        const CONTAINER_INHERIT = 0x02;
        const NO_PROPAGATE_INHERIT = 0x04;
        const INHERIT_ONLY = 0x08;
        const INHERITED = 0x10;
        const SUCCESSFUL_ACCESS = 0x40;
        const FAILED_ACCESS = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AceBody {
    /// Mask and SID of one of the [`AceType`]s.
    ///
    /// `trailing` holds whatever the declared ACE size covers beyond the SID.
    Standard {
        mask: AccessRights,
        sid: Sid,
        trailing: Vec<u8>,
    },
    /// Body of an ACE type we don't interpret, e.g. object or callback ACEs.
    Opaque(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ace {
    type_byte: u8,
    flags: AceFlags,
    body: AceBody,
}

impl Ace {
    pub fn new(ace_type: AceType, flags: AceFlags, mask: AccessRights, sid: Sid) -> Self {
        Self {
            type_byte: ace_type as u8,
            flags,
            body: AceBody::Standard {
                mask,
                sid,
                trailing: Vec::new(),
            },
        }
    }

    pub fn allow(sid: Sid, mask: AccessRights, flags: AceFlags) -> Self {
        Self::new(AceType::AccessAllowed, flags, mask, sid)
    }

    pub fn deny(sid: Sid, mask: AccessRights, flags: AceFlags) -> Self {
        Self::new(AceType::AccessDenied, flags, mask, sid)
    }

    /// `None` for ACE types we keep as opaque bytes.
    pub fn ace_type(&self) -> Option<AceType> {
        AceType::from_byte(self.type_byte)
    }

    pub fn type_byte(&self) -> u8 {
        self.type_byte
    }

    pub fn flags(&self) -> AceFlags {
        self.flags
    }

    pub fn body(&self) -> &AceBody {
        &self.body
    }

    pub fn is_inherited(&self) -> bool {
        self.flags.contains(AceFlags::INHERITED)
    }

    pub fn sid(&self) -> Option<&Sid> {
        match &self.body {
            AceBody::Standard { sid, .. } => Some(sid),
            AceBody::Opaque(_) => None,
        }
    }

    pub fn mask(&self) -> Option<AccessRights> {
        match &self.body {
            AceBody::Standard { mask, .. } => Some(*mask),
            AceBody::Opaque(_) => None,
        }
    }

    pub(crate) fn is_explicit_for(&self, trustee: &Sid) -> bool {
        !self.is_inherited() && self.sid() == Some(trustee)
    }

    pub fn encoded_len(&self) -> usize {
        ACE_HEADER_LEN
            + match &self.body {
                AceBody::Standard { sid, trailing, .. } => 4 + sid.encoded_len() + trailing.len(),
                AceBody::Opaque(bytes) => bytes.len(),
            }
    }

    /// Decodes one ACE from the front of `bytes`, returning it and its declared size.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), ParseError> {
        let header = take(bytes, 0, ACE_HEADER_LEN, "ACE header")?;
        let type_byte = header[0];
        let flags = AceFlags::from_bits_retain(header[1]);
        let size = read_u16(header, 2, "ACE size")?;

        if usize::from(size) < ACE_HEADER_LEN {
            return Err(ParseError::AceSize(size));
        }

        let ace = take(bytes, 0, usize::from(size), "ACE")?;
        let content = &ace[ACE_HEADER_LEN..];

        let body = match AceType::from_byte(type_byte) {
            Some(_) => {
                let mask = AccessRights::from_bits_retain(read_u32(content, 0, "ACE mask")?);
                let (sid, sid_len) = Sid::parse(content.get(4..).unwrap_or_default())?;

                AceBody::Standard {
                    mask,
                    sid,
                    trailing: content[4 + sid_len..].to_vec(),
                }
            }
            None => AceBody::Opaque(content.to_vec()),
        };

        Ok((
            Self {
                type_byte,
                flags,
                body,
            },
            usize::from(size),
        ))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        // ACEs are bounded by the 16-bit ACL size, anything we build stays far below that.
        let size = self.encoded_len() as u16;

        out.push(self.type_byte);
        out.push(self.flags.bits());
        out.extend_from_slice(&size.to_le_bytes());

        match &self.body {
            AceBody::Standard {
                mask,
                sid,
                trailing,
            } => {
                out.extend_from_slice(&mask.bits().to_le_bytes());
                sid.write_to(out);
                out.extend_from_slice(trailing);
            }
            AceBody::Opaque(bytes) => out.extend_from_slice(bytes),
        }
    }
}
