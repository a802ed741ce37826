use bitflags::bitflags;

use crate::{Acl, ParseError, Sid, read_u16, read_u32, take};

const HEADER_LEN: usize = 20;
const SECURITY_DESCRIPTOR_REVISION: u8 = 1;

bitflags! {
    /// `SECURITY_DESCRIPTOR_CONTROL`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Control: u16 {
        const OWNER_DEFAULTED = 0x0001;
        const GROUP_DEFAULTED = 0x0002;
        const DACL_PRESENT = 0x0004;
        const DACL_DEFAULTED = 0x0008;
        const SACL_PRESENT = 0x0010;
        const SACL_DEFAULTED = 0x0020;
        const DACL_AUTO_INHERIT_REQ = 0x0100;
        const SACL_AUTO_INHERIT_REQ = 0x0200;
        const DACL_AUTO_INHERITED = 0x0400;
        const SACL_AUTO_INHERITED = 0x0800;
        const DACL_PROTECTED = 0x1000;
        const SACL_PROTECTED = 0x2000;
        const RM_CONTROL_VALID = 0x4000;
        const SELF_RELATIVE = 0x8000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Owner,
    Group,
    Sacl,
    Dacl,
}

impl Component {
    /// Where `MakeSelfRelativeSD` puts components that weren't in the parsed buffer.
    const CANONICAL_ORDER: [Self; 4] = [Self::Sacl, Self::Dacl, Self::Owner, Self::Group];

    fn name(self) -> &'static str {
        match self {
            Self::Owner => "owner SID",
            Self::Group => "group SID",
            Self::Sacl => "SACL",
            Self::Dacl => "DACL",
        }
    }
}

/// A component's position in the parsed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    component: Component,
    /// Bytes between the end of the previous component (or the header) and this one.
    gap: Vec<u8>,
}

/// A security descriptor in self-relative form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDescriptor {
    revision: u8,
    rm_control: u8,
    control: Control,
    owner: Option<Sid>,
    group: Option<Sid>,
    sacl: Option<Acl>,
    dacl: Option<Acl>,
    layout: Vec<Slot>,
    trailing: Vec<u8>,
}

impl Default for SecurityDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityDescriptor {
    /// An empty descriptor: no owner, no group, no ACLs.
    pub fn new() -> Self {
        Self {
            revision: SECURITY_DESCRIPTOR_REVISION,
            rm_control: 0,
            control: Control::SELF_RELATIVE,
            owner: None,
            group: None,
            sacl: None,
            dacl: None,
            layout: Vec::new(),
            trailing: Vec::new(),
        }
    }

    pub fn control(&self) -> Control {
        self.control
    }

    pub fn owner(&self) -> Option<&Sid> {
        self.owner.as_ref()
    }

    pub fn set_owner(&mut self, owner: Option<Sid>) {
        self.owner = owner;
    }

    pub fn group(&self) -> Option<&Sid> {
        self.group.as_ref()
    }

    pub fn set_group(&mut self, group: Option<Sid>) {
        self.group = group;
    }

    pub fn sacl(&self) -> Option<&Acl> {
        self.sacl.as_ref()
    }

    /// `None` is either "no DACL" or a NULL DACL, see [`Control::DACL_PRESENT`].
    pub fn dacl(&self) -> Option<&Acl> {
        self.dacl.as_ref()
    }

    pub fn dacl_mut(&mut self) -> Option<&mut Acl> {
        self.dacl.as_mut()
    }

    pub fn set_dacl(&mut self, dacl: Option<Acl>) {
        self.control.set(Control::DACL_PRESENT, dacl.is_some());
        self.dacl = dacl;
    }

    /// Returns the DACL, creating an empty one if there is none.
    pub fn dacl_or_default(&mut self) -> &mut Acl {
        self.control.insert(Control::DACL_PRESENT);

        self.dacl.get_or_insert_with(Acl::new)
    }

    pub fn is_dacl_protected(&self) -> bool {
        self.control.contains(Control::DACL_PROTECTED)
    }

    /// Protected DACLs don't receive inherited entries from the parent.
    pub fn set_dacl_protected(&mut self, protected: bool) {
        self.control.set(Control::DACL_PROTECTED, protected);
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let header = take(bytes, 0, HEADER_LEN, "security descriptor header")?;

        let revision = header[0];
        if revision != SECURITY_DESCRIPTOR_REVISION {
            return Err(ParseError::DescriptorRevision(revision));
        }
        let rm_control = header[1];
        let control = Control::from_bits_retain(read_u16(header, 2, "control")?);
        if !control.contains(Control::SELF_RELATIVE) {
            return Err(ParseError::NotSelfRelative);
        }

        let offsets = [
            (Component::Owner, read_u32(header, 4, "owner offset")?),
            (Component::Group, read_u32(header, 8, "group offset")?),
            (Component::Sacl, read_u32(header, 12, "SACL offset")?),
            (Component::Dacl, read_u32(header, 16, "DACL offset")?),
        ];

        let mut sd = Self {
            revision,
            rm_control,
            control,
            ..Self::new()
        };

        // (offset, len, component)
        let mut spans = Vec::with_capacity(4);
        for (component, offset) in offsets {
            if offset == 0 {
                continue;
            }
            let offset = offset as usize;
            let rest = bytes.get(offset..).ok_or(ParseError::Truncated {
                what: component.name(),
                needed: offset,
                available: bytes.len(),
            })?;

            let len = match component {
                Component::Owner => {
                    let (sid, len) = Sid::parse(rest)?;
                    sd.owner = Some(sid);
                    len
                }
                Component::Group => {
                    let (sid, len) = Sid::parse(rest)?;
                    sd.group = Some(sid);
                    len
                }
                Component::Sacl => {
                    let (acl, len) = Acl::parse(rest)?;
                    sd.sacl = Some(acl);
                    len
                }
                Component::Dacl => {
                    let (acl, len) = Acl::parse(rest)?;
                    sd.dacl = Some(acl);
                    len
                }
            };
            spans.push((offset, len, component));
        }

        spans.sort_by_key(|(offset, _, _)| *offset);

        let mut end = HEADER_LEN;
        for (offset, len, component) in spans {
            if offset < end {
                return Err(ParseError::Overlap {
                    what: component.name(),
                    offset,
                });
            }
            sd.layout.push(Slot {
                component,
                gap: bytes[end..offset].to_vec(),
            });
            end = offset + len;
        }
        sd.trailing = bytes[end..].to_vec();

        Ok(sd)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        let mut offsets = [0u32; 4];

        let present = |c: Component| match c {
            Component::Owner => self.owner.is_some(),
            Component::Group => self.group.is_some(),
            Component::Sacl => self.sacl.is_some(),
            Component::Dacl => self.dacl.is_some(),
        };

        for slot in &self.layout {
            if !present(slot.component) {
                continue;
            }
            out.extend_from_slice(&slot.gap);
            self.write_component(slot.component, &mut out, &mut offsets);
        }
        for component in Component::CANONICAL_ORDER {
            if !present(component) || self.layout.iter().any(|s| s.component == component) {
                continue;
            }
            self.write_component(component, &mut out, &mut offsets);
        }
        out.extend_from_slice(&self.trailing);

        out[0] = self.revision;
        out[1] = self.rm_control;
        out[2..4].copy_from_slice(&self.control.bits().to_le_bytes());
        for (i, offset) in offsets.iter().enumerate() {
            out[4 + 4 * i..8 + 4 * i].copy_from_slice(&offset.to_le_bytes());
        }

        out
    }

    fn write_component(&self, component: Component, out: &mut Vec<u8>, offsets: &mut [u32; 4]) {
        let offset = out.len() as u32;

        match component {
            Component::Owner => {
                if let Some(sid) = &self.owner {
                    offsets[0] = offset;
                    sid.write_to(out);
                }
            }
            Component::Group => {
                if let Some(sid) = &self.group {
                    offsets[1] = offset;
                    sid.write_to(out);
                }
            }
            Component::Sacl => {
                if let Some(acl) = &self.sacl {
                    offsets[2] = offset;
                    acl.write_to(out);
                }
            }
            Component::Dacl => {
                if let Some(acl) = &self.dacl {
                    offsets[3] = offset;
                    acl.write_to(out);
                }
            }
        }
    }
}
