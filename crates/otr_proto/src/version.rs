//! Protocol versions.

use crate::error::ProtoError;

/// Ordered so that `max()` picks the preferred version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    None,
    Two,
    Three,
    Four,
}

/// Versions this implementation can speak.
pub const SUPPORTED: [Version; 3] = [Version::Two, Version::Three, Version::Four];

impl Version {
    pub fn wire(self) -> u16 {
        match self {
            Version::None => 0,
            Version::Two => 2,
            Version::Three => 3,
            Version::Four => 4,
        }
    }

    pub fn from_wire(v: u16) -> Result<Self, ProtoError> {
        match v {
            2 => Ok(Version::Two),
            3 => Ok(Version::Three),
            4 => Ok(Version::Four),
            other => Err(ProtoError::UnsupportedVersion(other)),
        }
    }

    /// v3 and v4 headers carry instance tags; v2 headers do not.
    pub fn has_instance_tags(self) -> bool {
        matches!(self, Version::Three | Version::Four)
    }

    pub fn digit(self) -> Option<char> {
        match self {
            Version::None => None,
            Version::Two => Some('2'),
            Version::Three => Some('3'),
            Version::Four => Some('4'),
        }
    }

    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '2' => Some(Version::Two),
            '3' => Some(Version::Three),
            '4' => Some(Version::Four),
            _ => None,
        }
    }
}
