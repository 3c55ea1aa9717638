//! Firmware version parsing and comparison
//!
//! Mesh radio firmware reports versions as `major.minor.patch`, often with a
//! trailing build hash (e.g. `2.3.2.f00db43`). Only the numeric triple takes
//! part in ordering; the build suffix is ignored.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A parsed firmware version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
}

impl FirmwareVersion {
    /// Create a version from its components
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check whether this version satisfies a required minimum
    pub fn meets_minimum(&self, minimum: &FirmwareVersion) -> bool {
        self >= minimum
    }
}

impl FromStr for FirmwareVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut parts = trimmed.split('.');

        let mut next_component = |name: &str| -> Result<u16, CoreError> {
            parts
                .next()
                .ok_or_else(|| CoreError::InvalidVersion(format!("{trimmed}: missing {name}")))?
                .parse::<u16>()
                .map_err(|_| CoreError::InvalidVersion(format!("{trimmed}: bad {name}")))
        };

        let major = next_component("major")?;
        let minor = next_component("minor")?;
        let patch = next_component("patch")?;

        // Anything after the triple is a build hash, ignored.
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_triple() {
        let v: FirmwareVersion = "2.3.0".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(2, 3, 0));
    }

    #[test]
    fn test_parse_with_build_hash() {
        let v: FirmwareVersion = "2.3.2.f00db43".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(2, 3, 2));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<FirmwareVersion>().is_err());
        assert!("2.3".parse::<FirmwareVersion>().is_err());
        assert!("a.b.c".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        let old: FirmwareVersion = "2.1.0".parse().unwrap();
        let min: FirmwareVersion = "2.3.0".parse().unwrap();
        let new: FirmwareVersion = "2.3.2".parse().unwrap();

        assert!(old < min);
        assert!(new > min);
        assert!(!old.meets_minimum(&min));
        assert!(new.meets_minimum(&min));
        assert!(min.meets_minimum(&min));
    }

    #[test]
    fn test_display_round_trip() {
        let v: FirmwareVersion = "2.3.15".parse().unwrap();
        assert_eq!(v.to_string(), "2.3.15");
    }
}
