use bitflags::bitflags;

bitflags! {
    /// A 32-bit access mask.
    ///
    /// Service-specific and file-specific rights share the low bits, which one applies
    /// depends on the object the ACE is attached to. Bits without a name here are kept
    /// as-is when parsing via [`AccessRights::from_bits_retain`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessRights: u32 {
        const QUERY_CONFIG = 0x0000_0001;
        const CHANGE_CONFIG = 0x0000_0002;
        const QUERY_STATUS = 0x0000_0004;
        const ENUMERATE_DEPENDENTS = 0x0000_0008;
        const START = 0x0000_0010;
        const STOP = 0x0000_0020;
        const PAUSE_CONTINUE = 0x0000_0040;
        const INTERROGATE = 0x0000_0080;
        const USER_DEFINED_CONTROL = 0x0000_0100;

        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;

        const SERVICE_ALL_ACCESS = 0x000F_01FF;

        const FULL_CONTROL = 0x001F_01FF;
        const READ = 0x0012_0089;
        const WRITE = 0x0012_0116;
        const EXECUTE = 0x0012_00A0;

        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;
    }
}

impl AccessRights {
    /// What interactive users get on the service object: enough to see and toggle it, nothing more.
    pub const SERVICE_USER_CONTROL: Self = Self::QUERY_STATUS
        .union(Self::START)
        .union(Self::STOP)
        .union(Self::INTERROGATE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_user_control_is_the_four_delegated_rights() {
        assert_eq!(AccessRights::SERVICE_USER_CONTROL.bits(), 0x4 | 0x10 | 0x20 | 0x80);
        assert!(!AccessRights::SERVICE_USER_CONTROL.contains(AccessRights::CHANGE_CONFIG));
        assert!(!AccessRights::SERVICE_USER_CONTROL.contains(AccessRights::DELETE));
    }

    #[test]
    fn unknown_bits_are_retained() {
        let rights = AccessRights::from_bits_retain(0x0100_0004);

        assert!(rights.contains(AccessRights::QUERY_STATUS));
        assert_eq!(rights.bits(), 0x0100_0004);
    }
}
