//! Loose semantic version parsing for kernel and engine version strings.

use std::fmt;
use std::str::FromStr;

use devstack_common::error::DevstackError;

/// A `major.minor.patch` triple. Missing components default to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl Version {
    /// Creates a version from its components.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl FromStr for Version {
    type Err = DevstackError;

    /// Accepts strings such as `5.14.0-427.el9.x86_64`, `4.9.4` or `6.1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DevstackError::Config {
            message: format!("unparseable version: {s:?}"),
        };
        let release = s.trim().split(['-', '+']).next().unwrap_or_default();
        let mut parts = release.split('.');
        let major = parts.next().and_then(leading_number).ok_or_else(invalid)?;
        let minor = parts.next().and_then(leading_number).unwrap_or(0);
        let patch = parts.next().and_then(leading_number).unwrap_or(0);
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
