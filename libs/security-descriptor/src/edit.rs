//! The edits we make to descriptors.
//!
//! Every edit works on explicit entries only. Inherited entries belong to the parent
//! object and are recomputed by the OS whenever the parent changes.

use crate::{AccessRights, Ace, AceFlags, AceType, Acl, ParseError, SecurityDescriptor, Sid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inheritance {
    /// Applies to the object itself only.
    None,
    /// Applies to the object and flows down to child files and directories.
    ObjectAndContainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

/// One explicit permission entry we want on an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub trustee: Sid,
    pub rights: AccessRights,
    pub inheritance: Inheritance,
    pub effect: Effect,
}

impl AccessRule {
    pub fn allow(trustee: Sid, rights: AccessRights) -> Self {
        Self {
            trustee,
            rights,
            inheritance: Inheritance::None,
            effect: Effect::Allow,
        }
    }

    pub fn deny(trustee: Sid, rights: AccessRights) -> Self {
        Self {
            effect: Effect::Deny,
            ..Self::allow(trustee, rights)
        }
    }

    pub fn inherited_by_children(self) -> Self {
        Self {
            inheritance: Inheritance::ObjectAndContainer,
            ..self
        }
    }

    pub fn to_ace(&self) -> Ace {
        let flags = match self.inheritance {
            Inheritance::None => AceFlags::empty(),
            Inheritance::ObjectAndContainer => {
                AceFlags::OBJECT_INHERIT | AceFlags::CONTAINER_INHERIT
            }
        };

        match self.effect {
            Effect::Allow => Ace::allow(self.trustee.clone(), self.rights, flags),
            Effect::Deny => Ace::deny(self.trustee.clone(), self.rights, flags),
        }
    }
}

/// A descriptor owned by `root.trustee` whose DACL holds `root` and nothing else.
///
/// The DACL is left unprotected so the object still picks up inherited entries from its parent.
pub fn build_exclusive_access(root: &AccessRule) -> SecurityDescriptor {
    let mut sd = SecurityDescriptor::new();
    sd.set_owner(Some(root.trustee.clone()));
    sd.set_dacl(Some(Acl::from_aces([root.to_ace()])));

    sd
}

/// Replaces the explicit entries of `rule.trustee` with the same effect by `rule`.
///
/// The new entry goes where Windows expects it: explicit denies first, then explicit allows,
/// then inherited entries.
pub fn set_access(sd: &mut SecurityDescriptor, rule: &AccessRule) {
    let wanted = match rule.effect {
        Effect::Allow => AceType::AccessAllowed,
        Effect::Deny => AceType::AccessDenied,
    };

    let aces = sd.dacl_or_default().aces_mut();
    aces.retain(|ace| !(ace.is_explicit_for(&rule.trustee) && ace.ace_type() == Some(wanted)));

    let position = match rule.effect {
        Effect::Deny => aces
            .iter()
            .position(|ace| ace.is_inherited() || ace.ace_type() != Some(AceType::AccessDenied)),
        Effect::Allow => aces.iter().position(Ace::is_inherited),
    }
    .unwrap_or(aces.len());

    aces.insert(position, rule.to_ace());
}

/// Removes every explicit entry and lets the DACL inherit from the parent again.
pub fn strip_explicit(sd: &mut SecurityDescriptor) {
    sd.set_dacl_protected(false);

    if let Some(dacl) = sd.dacl_mut() {
        dacl.aces_mut().retain(Ace::is_inherited);
    }
}

/// Narrows what `trustee` may do with a service to exactly `rights`.
///
/// Takes and returns the binary descriptor of the service object. Every explicit entry for
/// `trustee` is dropped and a single non-inheritable allow entry takes its place.
/// Entries of other principals, owner, group, SACL and control flags stay as they were.
pub fn narrow_service_access(
    existing: &[u8],
    trustee: &Sid,
    rights: AccessRights,
) -> Result<Vec<u8>, ParseError> {
    let mut sd = SecurityDescriptor::from_bytes(existing)?;

    if let Some(dacl) = sd.dacl_mut() {
        dacl.aces_mut().retain(|ace| !ace.is_explicit_for(trustee));
    }
    set_access(&mut sd, &AccessRule::allow(trustee.clone(), rights));

    Ok(sd.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Control,
        descriptor::tests::{raw_ace, raw_acl, raw_sd, raw_sid, service_descriptor_bytes},
    };

    fn explicit_for<'a>(sd: &'a SecurityDescriptor, sid: &Sid) -> Vec<&'a Ace> {
        sd.dacl()
            .map(|dacl| {
                dacl.aces()
                    .iter()
                    .filter(|ace| ace.is_explicit_for(sid))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn exclusive_access_has_one_rule_and_the_trustee_as_owner() {
        let rule = AccessRule::allow(Sid::local_service(), AccessRights::FULL_CONTROL)
            .inherited_by_children();

        let sd = build_exclusive_access(&rule);

        assert_eq!(sd.owner(), Some(&Sid::local_service()));
        assert!(!sd.is_dacl_protected());
        let aces = sd.dacl().unwrap().aces();
        assert_eq!(aces.len(), 1);
        assert_eq!(aces[0].sid(), Some(&Sid::local_service()));
        assert_eq!(aces[0].mask(), Some(AccessRights::FULL_CONTROL));
        assert_eq!(
            aces[0].flags(),
            AceFlags::OBJECT_INHERIT | AceFlags::CONTAINER_INHERIT
        );

        let reparsed = SecurityDescriptor::from_bytes(&sd.to_bytes()).unwrap();
        assert_eq!(reparsed.dacl(), sd.dacl());
    }

    #[test]
    fn narrowing_grants_exactly_the_delegated_rights() {
        let users = Sid::authenticated_users();

        let narrowed = narrow_service_access(
            &service_descriptor_bytes(),
            &users,
            AccessRights::SERVICE_USER_CONTROL,
        )
        .unwrap();

        let sd = SecurityDescriptor::from_bytes(&narrowed).unwrap();
        let entries = explicit_for(&sd, &users);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ace_type(), Some(AceType::AccessAllowed));
        assert_eq!(entries[0].mask(), Some(AccessRights::SERVICE_USER_CONTROL));
        assert_eq!(entries[0].flags(), AceFlags::empty());
    }

    #[test]
    fn narrowing_replaces_broader_existing_entries() {
        let users = raw_sid(5, &[11]);
        let bytes = raw_sd(
            0x8004,
            &[(
                'D',
                raw_acl(&[
                    raw_ace(1, 0, 0x0000_0004, &users),
                    raw_ace(0, 0, 0x000F_01FF, &raw_sid(5, &[18])),
                    raw_ace(0, 0, 0x000F_01FF, &users),
                ]),
            )],
            0,
        );

        let narrowed = narrow_service_access(
            &bytes,
            &Sid::authenticated_users(),
            AccessRights::SERVICE_USER_CONTROL,
        )
        .unwrap();

        let sd = SecurityDescriptor::from_bytes(&narrowed).unwrap();
        let aces = sd.dacl().unwrap().aces();
        assert_eq!(aces.len(), 2);
        assert_eq!(aces[0].sid(), Some(&Sid::local_system()));
        assert_eq!(aces[1].sid(), Some(&Sid::authenticated_users()));
        assert_eq!(aces[1].mask(), Some(AccessRights::SERVICE_USER_CONTROL));
    }

    #[test]
    fn narrowing_preserves_everything_else() {
        let bytes = service_descriptor_bytes();
        let before = SecurityDescriptor::from_bytes(&bytes).unwrap();

        let narrowed = narrow_service_access(
            &bytes,
            &Sid::authenticated_users(),
            AccessRights::SERVICE_USER_CONTROL,
        )
        .unwrap();
        let after = SecurityDescriptor::from_bytes(&narrowed).unwrap();

        assert_eq!(after.owner(), before.owner());
        assert_eq!(after.group(), before.group());
        assert_eq!(after.sacl(), before.sacl());
        assert_eq!(after.control(), before.control());

        let before_aces = before.dacl().unwrap().aces();
        let after_aces = after.dacl().unwrap().aces();
        assert_eq!(after_aces.len(), before_aces.len() + 1);
        assert_eq!(&after_aces[..before_aces.len()], before_aces);
    }

    #[test]
    fn narrowing_is_idempotent() {
        let once = narrow_service_access(
            &service_descriptor_bytes(),
            &Sid::authenticated_users(),
            AccessRights::SERVICE_USER_CONTROL,
        )
        .unwrap();
        let twice = narrow_service_access(
            &once,
            &Sid::authenticated_users(),
            AccessRights::SERVICE_USER_CONTROL,
        )
        .unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn narrowing_rejects_garbage() {
        assert!(
            narrow_service_access(
                &[1, 2, 3],
                &Sid::authenticated_users(),
                AccessRights::SERVICE_USER_CONTROL
            )
            .is_err()
        );
    }

    #[test]
    fn strip_keeps_only_inherited_entries_and_unprotects() {
        let inherited = raw_ace(0, 0x10 | 0x3, 0x001F_01FF, &raw_sid(5, &[18]));
        let bytes = raw_sd(
            0x8000 | 0x0004 | 0x1000,
            &[(
                'D',
                raw_acl(&[
                    raw_ace(1, 0, 0x0012_0116, &raw_sid(1, &[0])),
                    raw_ace(0, 0x3, 0x001F_01FF, &raw_sid(5, &[19])),
                    inherited.clone(),
                ]),
            )],
            0,
        );
        let mut sd = SecurityDescriptor::from_bytes(&bytes).unwrap();

        strip_explicit(&mut sd);

        assert!(!sd.control().contains(Control::DACL_PROTECTED));
        let aces = sd.dacl().unwrap().aces();
        assert_eq!(aces.len(), 1);
        assert!(aces[0].is_inherited());
        let mut out = Vec::new();
        aces[0].write_to(&mut out);
        assert_eq!(out, inherited);
    }

    #[test]
    fn strip_then_grant_leaves_one_explicit_rule() {
        let bytes = raw_sd(
            0x8004,
            &[(
                'D',
                raw_acl(&[
                    raw_ace(0, 0x3, 0x001F_01FF, &raw_sid(5, &[19])),
                    raw_ace(0, 0x13, 0x001F_01FF, &raw_sid(5, &[18])),
                ]),
            )],
            0,
        );
        let mut sd = SecurityDescriptor::from_bytes(&bytes).unwrap();
        let owner: Sid = "S-1-5-21-1-2-3-1001".parse().unwrap();

        strip_explicit(&mut sd);
        set_access(
            &mut sd,
            &AccessRule::allow(owner.clone(), AccessRights::FULL_CONTROL).inherited_by_children(),
        );

        let aces = sd.dacl().unwrap().aces();
        let explicit = aces.iter().filter(|a| !a.is_inherited()).collect::<Vec<_>>();
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].sid(), Some(&owner));
        // Explicit entries go before inherited ones.
        assert_eq!(aces[0].sid(), Some(&owner));
    }

    #[test]
    fn deny_rules_go_first() {
        let mut sd = build_exclusive_access(&AccessRule::allow(
            Sid::local_system(),
            AccessRights::FULL_CONTROL,
        ));

        set_access(
            &mut sd,
            &AccessRule::deny(Sid::world(), AccessRights::WRITE),
        );

        let aces = sd.dacl().unwrap().aces();
        assert_eq!(aces[0].ace_type(), Some(AceType::AccessDenied));
        assert_eq!(aces[1].sid(), Some(&Sid::local_system()));
    }

    #[test]
    fn set_access_on_null_dacl_creates_one() {
        let mut sd = SecurityDescriptor::new();

        set_access(
            &mut sd,
            &AccessRule::allow(Sid::interactive(), AccessRights::READ),
        );

        assert!(sd.control().contains(Control::DACL_PRESENT));
        assert_eq!(sd.dacl().unwrap().aces().len(), 1);
    }
}
