//! Semantic versions for event schemas.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a version string is not `MAJOR.MINOR.PATCH`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid semantic version: {0:?}")]
pub struct SemVerError(pub String);

/// A `MAJOR.MINOR.PATCH` schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `MAJOR.MINOR.PATCH`. Pre-release and build suffixes are rejected.
    pub fn parse(s: &str) -> Result<Self, SemVerError> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32, SemVerError> {
            parts
                .next()
                .and_then(|p| {
                    if p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()) {
                        None
                    } else {
                        p.parse().ok()
                    }
                })
                .ok_or_else(|| SemVerError(s.to_string()))
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(SemVerError(s.to_string()));
        }
        Ok(version)
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for SemVer {
    type Error = SemVerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SemVer> for String {
    fn from(version: SemVer) -> Self {
        version.to_string()
    }
}

/// A half-open range `[min, max)` of accepted schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: SemVer,
    pub max_exclusive: SemVer,
}

impl VersionRange {
    pub const fn new(min: SemVer, max_exclusive: SemVer) -> Self {
        Self { min, max_exclusive }
    }

    /// All versions sharing the given major: `[major.0.0, major+1.0.0)`.
    pub const fn major(major: u32) -> Self {
        Self {
            min: SemVer::new(major, 0, 0),
            max_exclusive: SemVer::new(major + 1, 0, 0),
        }
    }

    pub fn contains(&self, version: &SemVer) -> bool {
        *version >= self.min && *version < self.max_exclusive
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ">={}, <{}", self.min, self.max_exclusive)
    }
}
