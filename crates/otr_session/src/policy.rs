//! Session policy flags.

use otr_proto::version::Version;

/// Bitset controlling which protocol versions a session may speak and how
/// eagerly it negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OtrPolicy(u32);

impl OtrPolicy {
    pub const ALLOW_V2: OtrPolicy = OtrPolicy(1 << 0);
    pub const ALLOW_V3: OtrPolicy = OtrPolicy(1 << 1);
    pub const ALLOW_V4: OtrPolicy = OtrPolicy(1 << 2);
    pub const REQUIRE_ENCRYPTION: OtrPolicy = OtrPolicy(1 << 3);
    pub const WHITESPACE_START_AKE: OtrPolicy = OtrPolicy(1 << 4);
    pub const ERROR_START_AKE: OtrPolicy = OtrPolicy(1 << 5);
    pub const SEND_WHITESPACE_TAG: OtrPolicy = OtrPolicy(1 << 6);

    pub const fn empty() -> Self {
        OtrPolicy(0)
    }

    /// All versions, opportunistic negotiation.
    pub const fn opportunistic() -> Self {
        OtrPolicy(
            Self::ALLOW_V2.0
                | Self::ALLOW_V3.0
                | Self::ALLOW_V4.0
                | Self::WHITESPACE_START_AKE.0
                | Self::ERROR_START_AKE.0
                | Self::SEND_WHITESPACE_TAG.0,
        )
    }

    pub const fn with(self, other: OtrPolicy) -> Self {
        OtrPolicy(self.0 | other.0)
    }

    pub const fn without(self, other: OtrPolicy) -> Self {
        OtrPolicy(self.0 & !other.0)
    }

    pub const fn contains(self, other: OtrPolicy) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn allows_version(self, version: Version) -> bool {
        match version {
            Version::Two => self.contains(Self::ALLOW_V2),
            Version::Three => self.contains(Self::ALLOW_V3),
            Version::Four => self.contains(Self::ALLOW_V4),
            Version::None => false,
        }
    }

    /// Allowed versions, oldest first.
    pub fn allowed_versions(self) -> Vec<Version> {
        [Version::Two, Version::Three, Version::Four]
            .into_iter()
            .filter(|v| self.allows_version(*v))
            .collect()
    }

    /// A policy that allows no version cannot negotiate anything.
    pub fn viable(self) -> bool {
        !self.allowed_versions().is_empty()
    }
}

impl std::ops::BitOr for OtrPolicy {
    type Output = OtrPolicy;
    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_composition() {
        let p = OtrPolicy::ALLOW_V3 | OtrPolicy::ALLOW_V4 | OtrPolicy::REQUIRE_ENCRYPTION;
        assert!(p.contains(OtrPolicy::ALLOW_V3));
        assert!(p.contains(OtrPolicy::REQUIRE_ENCRYPTION));
        assert!(!p.contains(OtrPolicy::ALLOW_V2));
        assert_eq!(p.allowed_versions(), vec![Version::Three, Version::Four]);
    }

    #[test]
    fn viability() {
        assert!(!OtrPolicy::REQUIRE_ENCRYPTION.viable());
        assert!(OtrPolicy::ALLOW_V2.viable());
    }

    #[test]
    fn without_removes() {
        let p = OtrPolicy::opportunistic().without(OtrPolicy::ALLOW_V2);
        assert!(!p.allows_version(Version::Two));
        assert!(p.allows_version(Version::Four));
    }
}
