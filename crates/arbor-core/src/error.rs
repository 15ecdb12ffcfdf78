//! Error types for the Arbor substrate

use std::time::Duration;

use thiserror::Error;

use crate::{BootStage, Key, ObjectType};

/// Core Arbor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of capacity: {resource} (limit {limit})")]
    OutOfCapacity { resource: &'static str, limit: usize },

    #[error("Insufficient stock of {object}: requested {requested}, available {available}")]
    InsufficientStock {
        object: ObjectType,
        requested: u64,
        available: u64,
    },

    #[error("Security attestation failed: {0}")]
    SecurityAttestationFailed(String),

    #[error("Timeout: {operation} exceeded its {budget:?} budget")]
    Timeout {
        operation: &'static str,
        budget: Duration,
    },

    #[error("Unimplemented: {0}")]
    Unimplemented(&'static str),

    // Lifecycle errors
    #[error("Membrane {0} is dissolved")]
    Dissolved(Key),

    #[error("Bootstrap halted at {0:?}")]
    Halted(BootStage),
}

/// The six error classes callers report on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    InvalidArgument,
    OutOfCapacity,
    InsufficientStock,
    SecurityAttestationFailed,
    Timeout,
    Unimplemented,
}

impl KernelError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        KernelError::InvalidArgument(msg.into())
    }

    pub fn capacity(resource: &'static str, limit: usize) -> Self {
        KernelError::OutOfCapacity { resource, limit }
    }

    /// Map onto the reporting taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            KernelError::InvalidArgument(_) | KernelError::Dissolved(_) => {
                ErrorClass::InvalidArgument
            }
            KernelError::OutOfCapacity { .. } => ErrorClass::OutOfCapacity,
            KernelError::InsufficientStock { .. } => ErrorClass::InsufficientStock,
            KernelError::SecurityAttestationFailed(_) | KernelError::Halted(_) => {
                ErrorClass::SecurityAttestationFailed
            }
            KernelError::Timeout { .. } => ErrorClass::Timeout,
            KernelError::Unimplemented(_) => ErrorClass::Unimplemented,
        }
    }

    /// Fatal errors stop the bootstrap sequence; everything else is local
    /// to the loop or membrane that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::SecurityAttestationFailed(_) | KernelError::Halted(_)
        )
    }
}

/// Result type for Arbor operations
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            KernelError::invalid("double release").class(),
            ErrorClass::InvalidArgument
        );
        assert_eq!(
            KernelError::Dissolved(Key::new(3)).class(),
            ErrorClass::InvalidArgument
        );
        assert_eq!(
            KernelError::capacity("children", 2).class(),
            ErrorClass::OutOfCapacity
        );
        assert_eq!(
            KernelError::Halted(BootStage::Stage0).class(),
            ErrorClass::SecurityAttestationFailed
        );
    }

    #[test]
    fn test_fatality() {
        assert!(KernelError::SecurityAttestationFailed("digest".into()).is_fatal());
        assert!(!KernelError::Timeout {
            operation: "evolve",
            budget: Duration::from_micros(10)
        }
        .is_fatal());
    }

    #[test]
    fn test_display() {
        let err = KernelError::InsufficientStock {
            object: ObjectType::new(4),
            requested: 3,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient stock of obj#4: requested 3, available 1"
        );
    }
}
