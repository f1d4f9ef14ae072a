//! Result codes.
//!
//! Every public operation returns one of these codes on failure. The set is
//! closed: embedders can match exhaustively and the collector guarantees the
//! arena is consistent after any returned error.

use std::fmt;
use std::io;

/// The collector's result type.
pub type Result<T> = std::result::Result<T, GcError>;

/// Failure codes returned by collector operations.
#[derive(Debug)]
pub enum GcError {
    /// Out of managed memory (arena address space or control structures).
    Memory,
    /// An operating-system resource could not be obtained.
    Resource(io::Error),
    /// A configured limit was reached (e.g. all trace slots busy).
    Limit,
    /// The operation is not supported by this pool class.
    Unimpl,
    /// The operation was semantically declined (e.g. a single-reference
    /// access could not be handled and the caller must fall back).
    Fail,
    /// An I/O error outside the memory subsystem.
    Io(io::Error),
    /// An argument was invalid.
    Param,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "out of managed memory"),
            Self::Resource(e) => write!(f, "out of OS resource: {e}"),
            Self::Limit => write!(f, "configured limit reached"),
            Self::Unimpl => write!(f, "operation not supported by this pool class"),
            Self::Fail => write!(f, "operation declined"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Param => write!(f, "invalid parameter"),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resource(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl GcError {
    /// Whether this error is an allocation failure that emergency mode can
    /// absorb mid-trace.
    #[must_use]
    pub fn is_alloc_failure(&self) -> bool {
        matches!(self, Self::Memory | Self::Resource(_) | Self::Limit)
    }
}
