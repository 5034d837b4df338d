//! Versioning primitives for optimistic concurrency on mutable rows and event streams.

use crate::error::{DomainError, DomainResult};

/// Anything whose persisted state carries a monotonically increasing version.
///
/// Stock-card streams count appended events and movements; drafts and sub-drafts
/// count saves. Stores compare the version a writer read against the version they
/// hold at commit time.
pub trait Versioned {
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a stream or mutable row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (first write, administrative rebuilds).
    Any,
    /// Require the target to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        match self {
            ExpectedVersion::Exact(expected) if expected != actual => {
                Err(DomainError::VersionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

impl<T: Versioned> From<&T> for ExpectedVersion {
    fn from(value: &T) -> Self {
        ExpectedVersion::Exact(value.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row(u64);

    impl Versioned for Row {
        fn version(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn exact_expectation_rejects_stale_version() {
        let expected = ExpectedVersion::from(&Row(3));
        assert!(expected.check(3).is_ok());
        assert!(matches!(expected.check(4), Err(DomainError::VersionMismatch { expected: 3, actual: 4 })));
        assert!(ExpectedVersion::Any.matches(42));
    }
}
