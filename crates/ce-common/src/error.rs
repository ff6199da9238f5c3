//! Error types for carrier-ethernet operations.
//!
//! All expected failures (rejected requests, exhausted resources, partial
//! connectivity) are reported through `CeError`; panics are reserved for
//! programming errors.

use std::io;
use thiserror::Error;

/// Result type alias for carrier-ethernet operations.
pub type CeResult<T> = Result<T, CeError>;

/// Errors that can occur while provisioning carrier-ethernet services.
#[derive(Debug, Error)]
pub enum CeError {
    /// A service request is malformed or incompatible with current state.
    /// No state is mutated when this is returned.
    #[error("Validation failed: {reason}")]
    Validation {
        /// Why the request was rejected.
        reason: String,
    },

    /// An identifier or tag space has no free values left.
    #[error("Resource exhausted: no available {resource}")]
    ResourceExhausted {
        /// The exhausted resource (e.g. "VLAN id", "EVC short id").
        resource: &'static str,
    },

    /// A referenced resource does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// The resource kind (e.g. "EVC", "LTP").
        kind: &'static str,
        /// The resource identifier.
        id: String,
    },

    /// A resource cannot be removed because it is still referenced.
    /// The resource remains present; the caller must release owners first.
    #[error("{kind} '{id}' is still in use ({refs} references)")]
    ResourceInUse {
        /// The resource kind.
        kind: &'static str,
        /// The resource identifier.
        id: String,
        /// The current reference count.
        refs: u32,
    },

    /// No feasible path exists between two attachment points.
    #[error("No feasible path between {src} and {dst}")]
    NoFeasiblePath {
        /// The source device or connect point.
        src: String,
        /// The destination device or connect point.
        dst: String,
    },

    /// The underlying transport circuit could not be established.
    #[error("Transport circuit failure: {reason}")]
    Transport {
        /// Why the circuit setup failed.
        reason: String,
    },

    /// Configuration surface error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The offending field or key.
        field: String,
        /// Error message.
        message: String,
    },

    /// Failed to read a configuration file.
    #[error("Config file error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse a configuration file.
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CeError {
    /// Creates a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Creates a resource-exhausted error.
    pub fn exhausted(resource: &'static str) -> Self {
        Self::ResourceExhausted { resource }
    }

    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a resource-in-use error.
    pub fn in_use(kind: &'static str, id: impl Into<String>, refs: u32) -> Self {
        Self::ResourceInUse {
            kind,
            id: id.into(),
            refs,
        }
    }

    /// Creates a no-feasible-path error.
    pub fn no_path(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self::NoFeasiblePath {
            src: src.into(),
            dst: dst.into(),
        }
    }

    /// Creates a transport failure error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error left no state behind (pure rejection).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CeError::Validation { .. }
                | CeError::ResourceExhausted { .. }
                | CeError::NotFound { .. }
                | CeError::InvalidConfig { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CeError::not_found("EVC", "EP-Line-7");
        assert_eq!(err.to_string(), "EVC 'EP-Line-7' not found");
    }

    #[test]
    fn test_in_use_display() {
        let err = CeError::in_use("FC", "FC-100", 2);
        assert_eq!(err.to_string(), "FC 'FC-100' is still in use (2 references)");
    }

    #[test]
    fn test_is_rejection() {
        assert!(CeError::validation("bad request").is_rejection());
        assert!(CeError::exhausted("VLAN id").is_rejection());
        assert!(!CeError::in_use("LTP", "of:1/1", 1).is_rejection());
        assert!(!CeError::transport("timeout").is_rejection());
    }
}
