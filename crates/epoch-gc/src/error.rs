//! Error type for recoverable runtime failures.
//!
//! Protocol violations (epoch regression, double frees, corrupted pages) are
//! not represented here: they panic, since a corrupted heap cannot continue.

use std::fmt;
use std::io;

/// Failures surfaced by the fallible runtime entry points.
#[derive(Debug)]
pub enum GcError {
    /// The allocation could not be satisfied even after a collection.
    OutOfMemory {
        /// Size of the request in bytes.
        requested: usize,
    },
    /// Mapping a new page would exceed the configured heap limit.
    HeapLimitExceeded {
        /// Bytes the new page needs.
        requested: usize,
        /// The configured limit.
        limit: usize,
    },
    /// The OS refused to map a page.
    PageMapping(io::Error),
    /// The allocation request is malformed.
    InvalidAllocation(&'static str),
    /// A runtime thread could not be spawned.
    ThreadSpawn(io::Error),
}

impl GcError {
    /// Returns `true` for failures that a collection might resolve.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::HeapLimitExceeded { .. } | Self::PageMapping(_)
        )
    }
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            Self::HeapLimitExceeded { requested, limit } => write!(
                f,
                "mapping {requested} bytes would exceed the heap limit of {limit} bytes"
            ),
            Self::PageMapping(err) => write!(f, "failed to map heap page: {err}"),
            Self::InvalidAllocation(reason) => write!(f, "invalid allocation: {reason}"),
            Self::ThreadSpawn(err) => write!(f, "failed to spawn runtime thread: {err}"),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PageMapping(err) | Self::ThreadSpawn(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_source() {
        let err = GcError::HeapLimitExceeded {
            requested: 4096,
            limit: 1024,
        };
        assert!(err.to_string().contains("heap limit of 1024"));
        assert!(err.is_out_of_memory());

        let err = GcError::PageMapping(io::Error::from(io::ErrorKind::OutOfMemory));
        assert!(std::error::Error::source(&err).is_some());

        let err = GcError::InvalidAllocation("array size overflow");
        assert!(!err.is_out_of_memory());
        assert_eq!(err.to_string(), "invalid allocation: array size overflow");
    }
}
