//! Boot stages and security levels

/// Bootstrap stage - strictly forward, `Halted` is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootStage {
    /// Firmware: attestation gate
    Stage0,
    /// Hypervisor: object store, root pair, contexts
    Stage1,
    /// Kernel partitions
    Stage2,
    /// Services, applications, threads
    Stage3,
    Running,
    Halted,
}

impl BootStage {
    /// The stage that follows a successful run of this one
    pub fn next(self) -> Option<BootStage> {
        match self {
            BootStage::Stage0 => Some(BootStage::Stage1),
            BootStage::Stage1 => Some(BootStage::Stage2),
            BootStage::Stage2 => Some(BootStage::Stage3),
            BootStage::Stage3 => Some(BootStage::Running),
            BootStage::Running | BootStage::Halted => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BootStage::Stage0 => "firmware",
            BootStage::Stage1 => "hypervisor",
            BootStage::Stage2 => "partitions",
            BootStage::Stage3 => "userspace",
            BootStage::Running => "running",
            BootStage::Halted => "halted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BootStage::Running | BootStage::Halted)
    }
}

/// Privilege tier of a context, firmware lowest
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum SecurityLevel {
    Firmware = -3,
    Device = -2,
    Hypervisor = -1,
    Kernel = 0,
    Service = 1,
    App = 2,
    Thread = 3,
}

impl SecurityLevel {
    #[inline]
    pub fn to_i8(self) -> i8 {
        self as i8
    }

    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            -3 => Some(SecurityLevel::Firmware),
            -2 => Some(SecurityLevel::Device),
            -1 => Some(SecurityLevel::Hypervisor),
            0 => Some(SecurityLevel::Kernel),
            1 => Some(SecurityLevel::Service),
            2 => Some(SecurityLevel::App),
            3 => Some(SecurityLevel::Thread),
            _ => None,
        }
    }

    /// Code running at this level may act on contexts at `other`
    pub fn dominates(self, other: SecurityLevel) -> bool {
        self <= other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = BootStage::Stage0;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(stage, BootStage::Running);
        assert!(BootStage::Halted.next().is_none());
    }

    #[test]
    fn test_security_level_roundtrip() {
        for v in -3..=3 {
            let level = SecurityLevel::from_i8(v).unwrap();
            assert_eq!(level.to_i8(), v);
        }
        assert!(SecurityLevel::from_i8(4).is_none());
        assert!(SecurityLevel::Hypervisor.dominates(SecurityLevel::Kernel));
        assert!(!SecurityLevel::Thread.dominates(SecurityLevel::Service));
    }
}
