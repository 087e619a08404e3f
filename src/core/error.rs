// This module defines the error types for the arbgen backend using the thiserror crate.
// CompileError is the single enum every stage propagates: graph invariant violations,
// statements without a lowering under the active capability profile, control shapes the
// profile cannot express, register-class exhaustion, collaborator (upload) failures and
// state-machine misuse. Each variant carries the context a caller needs to decide whether
// to retry with a different profile. CompileResult<T> is the convenience alias.

//! Error types for the arbgen backend.

use thiserror::Error;

/// Main error type for program generation and upload.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Graph invariant violated: {reason}")]
    GraphInvariant { reason: String },

    #[error("Operation {op} has no lowering under profile {profile} ({context})")]
    UnsupportedOperation {
        op: &'static str,
        profile: &'static str,
        context: String,
    },

    #[error("Control flow shape {shape} is not expressible under profile {profile}")]
    UnsupportedControlFlow {
        shape: &'static str,
        profile: &'static str,
    },

    #[error("out of {class} registers: requested {requested}, available {available}")]
    RegisterOverflow {
        class: &'static str,
        requested: usize,
        available: usize,
    },

    #[error("Upload failed: {0}")]
    Upload(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Cannot {action} a program in state {state}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },

    #[error("Unknown profile: {name}")]
    UnknownProfile { name: String },

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },
}

impl CompileError {
    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        CompileError::GraphInvariant {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_message_names_class_and_counts() {
        let err = CompileError::RegisterOverflow {
            class: "temp",
            requested: 33,
            available: 32,
        };
        assert_eq!(
            err.to_string(),
            "out of temp registers: requested 33, available 32"
        );
    }

    #[test]
    fn test_upload_error_keeps_source() {
        let inner: Box<dyn std::error::Error + Send + Sync> = "device said no".into();
        let err = CompileError::Upload(inner);
        assert!(err.to_string().contains("device said no"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
