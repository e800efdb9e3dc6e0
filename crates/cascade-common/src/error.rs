//! Error types for the cascade engine.

use thiserror::Error;

/// Result type alias using CascadeError.
pub type Result<T> = std::result::Result<T, CascadeError>;

/// Errors that can occur in cascade engine operations.
#[derive(Debug, Clone, Error)]
pub enum CascadeError {
    // Usage errors: programmer bugs that would otherwise corrupt state.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // Transient resource errors
    #[error("out of memory: failed to reserve {requested} buffer elements")]
    OutOfMemory { requested: usize },

    // Offload-device errors (the CPU path always remains available)
    #[error("offload device error: {0}")]
    Offload(String),

    // Shutdown races
    #[error("engine closed")]
    EngineClosed,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // Wire-format errors
    #[error("wire format error: {0}")]
    Wire(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl CascadeError {
    /// Shorthand for an invariant-violation error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        CascadeError::InvariantViolation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_violation_display() {
        let err = CascadeError::invariant("buffer capacity exceeded");
        assert_eq!(
            err.to_string(),
            "invariant violation: buffer capacity exceeded"
        );
    }

    #[test]
    fn test_out_of_memory_display() {
        let err = CascadeError::OutOfMemory {
            requested: 16_777_216,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: failed to reserve 16777216 buffer elements"
        );
    }

    #[test]
    fn test_offload_display() {
        let err = CascadeError::Offload("device busy".to_string());
        assert_eq!(err.to_string(), "offload device error: device busy");
    }

    #[test]
    fn test_engine_closed_display() {
        assert_eq!(CascadeError::EngineClosed.to_string(), "engine closed");
    }

    #[test]
    fn test_config_display() {
        let err = CascadeError::Config("fanout must be at least 2".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: fanout must be at least 2"
        );
    }

    #[test]
    fn test_wire_display() {
        let err = CascadeError::Wire("truncated record".to_string());
        assert_eq!(err.to_string(), "wire format error: truncated record");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u32> {
            Ok(7)
        }

        fn returns_err() -> Result<u32> {
            Err(CascadeError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CascadeError>();
    }

    #[test]
    fn test_error_is_clone() {
        let err = CascadeError::invariant("split index out of range");
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
