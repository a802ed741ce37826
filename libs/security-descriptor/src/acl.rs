use crate::{Ace, ParseError, read_u16, take};

const ACL_HEADER_LEN: usize = 8;
const ACL_REVISION: u8 = 2;

/// An access control list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    revision: u8,
    aces: Vec<Ace>,
    /// Bytes between the last ACE and the declared ACL size.
    slack: Vec<u8>,
}

impl Default for Acl {
    fn default() -> Self {
        Self::new()
    }
}

impl Acl {
    pub fn new() -> Self {
        Self {
            revision: ACL_REVISION,
            aces: Vec::new(),
            slack: Vec::new(),
        }
    }

    pub fn from_aces(aces: impl IntoIterator<Item = Ace>) -> Self {
        Self {
            aces: aces.into_iter().collect(),
            ..Self::new()
        }
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    pub fn aces(&self) -> &[Ace] {
        &self.aces
    }

    pub fn aces_mut(&mut self) -> &mut Vec<Ace> {
        &mut self.aces
    }

    pub fn encoded_len(&self) -> usize {
        ACL_HEADER_LEN + self.aces.iter().map(Ace::encoded_len).sum::<usize>() + self.slack.len()
    }

    /// Decodes an ACL from the front of `bytes`, returning it and its declared size.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), ParseError> {
        let header = take(bytes, 0, ACL_HEADER_LEN, "ACL header")?;
        let revision = header[0];
        let size = read_u16(header, 2, "ACL size")?;
        let count = read_u16(header, 4, "ACE count")?;

        if usize::from(size) < ACL_HEADER_LEN {
            return Err(ParseError::AclSize(size));
        }

        let acl = take(bytes, 0, usize::from(size), "ACL")?;

        let mut offset = ACL_HEADER_LEN;
        let mut aces = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (ace, len) = Ace::parse(&acl[offset..])?;
            aces.push(ace);
            offset += len;
        }

        Ok((
            Self {
                revision,
                aces,
                slack: acl[offset..].to_vec(),
            },
            usize::from(size),
        ))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let size = self.encoded_len() as u16;
        let count = self.aces.len() as u16;

        out.push(self.revision);
        out.push(0);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&[0, 0]);

        for ace in &self.aces {
            ace.write_to(out);
        }
        out.extend_from_slice(&self.slack);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out);

        out
    }
}
