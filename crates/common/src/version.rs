use serde::{Deserialize, Serialize};

/// Compare-and-swap token of a saga record.
///
/// An unsaved saga is at version 0. Creating it stores version 1 and every
/// accepted update stores exactly one more than the version it replaced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a saga that has never been written.
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsaved_saga_moves_to_version_one() {
        assert_eq!(Version::default(), Version::initial());
        assert_eq!(Version::initial().next().as_i64(), 1);
        assert!(Version::new(3) < Version::new(3).next());
    }

    #[test]
    fn display_is_prefixed() {
        assert_eq!(Version::new(7).to_string(), "v7");
    }
}
