//! Migration error types
//!
//! Every failure the engine reports maps onto one of five classes. The
//! batched engine only looks at the class: transient results are retried,
//! exhausted results split or abort, unsupported results reroute, and
//! permanent results drop the frame from the run.

use thiserror::Error;

use crate::mm::NodeId;

/// Error classes driving the engines' retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Refcount or slot mismatch, lock contention, writeback under async
    Transient,
    /// Destination allocation failed
    Exhausted,
    /// This frame type cannot take the requested path
    Unsupported,
    /// Busy beyond retry, unsupported huge size, not applicable
    Permanent,
    /// Bad address, node or permission in a bulk request
    Addressing,
}

/// Migration errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MigrateError {
    #[error("frame busy, try again")]
    Again,

    #[error("frame busy")]
    Busy,

    #[error("out of memory for destination frame")]
    NoMem,

    #[error("migration not supported for this frame")]
    NoSys,

    #[error("frame not eligible for the batched path")]
    NoDev,

    #[error("bad address")]
    Fault,

    #[error("no frame at address")]
    NoEnt,

    #[error("permission denied")]
    Access,

    #[error("invalid argument")]
    Inval,

    #[error("I/O error during writeout")]
    Io,

    #[error("invalid destination node {0}")]
    InvalidNode(NodeId),
}

impl MigrateError {
    /// Classify this error
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Again => ErrorClass::Transient,
            Self::NoMem => ErrorClass::Exhausted,
            Self::NoDev => ErrorClass::Unsupported,
            Self::Busy | Self::NoSys | Self::Inval | Self::Io => ErrorClass::Permanent,
            Self::Fault | Self::NoEnt | Self::Access | Self::InvalidNode(_) => {
                ErrorClass::Addressing
            }
        }
    }

    /// Whether the batched engine should try this frame again
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Negative errno, as reported in per-address status
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Again => -11,
            Self::Busy => -16,
            Self::NoMem => -12,
            Self::NoSys => -38,
            Self::NoDev | Self::InvalidNode(_) => -19,
            Self::Fault => -14,
            Self::NoEnt => -2,
            Self::Access => -13,
            Self::Inval => -22,
            Self::Io => -5,
        }
    }
}

/// Result type for migration operations
pub type Result<T> = core::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(MigrateError::Again.is_transient());
        assert_eq!(MigrateError::NoMem.class(), ErrorClass::Exhausted);
        assert_eq!(MigrateError::NoDev.class(), ErrorClass::Unsupported);
        assert_eq!(MigrateError::Busy.class(), ErrorClass::Permanent);
        assert_eq!(MigrateError::InvalidNode(7).class(), ErrorClass::Addressing);
    }

    #[test]
    fn test_errno_values() {
        assert_eq!(MigrateError::NoEnt.errno(), -2);
        assert_eq!(MigrateError::Access.errno(), -13);
        assert_eq!(MigrateError::InvalidNode(3).errno(), -19);
    }
}
