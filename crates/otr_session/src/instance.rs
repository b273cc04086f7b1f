//! Instance tags.

use rand::rngs::OsRng;
use rand::RngCore;

/// 32-bit client-instance identifier. Zero means "unassigned"; values below
/// 0x100 are reserved by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceTag(pub u32);

impl InstanceTag {
    pub const ZERO: InstanceTag = InstanceTag(0);
    pub const SMALLEST_VALUE: u32 = 0x100;

    /// Random tag in the valid range. Stable for the profile's lifetime.
    pub fn random() -> Self {
        loop {
            let v = OsRng.next_u32();
            if v >= Self::SMALLEST_VALUE {
                return InstanceTag(v);
            }
        }
    }

    pub fn is_valid(self) -> bool {
        self.0 >= Self::SMALLEST_VALUE
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for InstanceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tags_are_valid() {
        for _ in 0..16 {
            assert!(InstanceTag::random().is_valid());
        }
    }

    #[test]
    fn reserved_range() {
        assert!(!InstanceTag(0).is_valid());
        assert!(!InstanceTag(0xff).is_valid());
        assert!(InstanceTag(0x100).is_valid());
    }
}
