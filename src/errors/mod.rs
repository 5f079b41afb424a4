//! # Error Handling
//!
//! Error types for the flowmesh snapshot core, defined with `thiserror`.
//!
//! Only invariant violations and configuration problems surface as errors.
//! Missing resource references during group specialization are absorbed by the
//! snapshot factory and never reach this type.

/// Custom result type for flowmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the flowmesh snapshot core
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Two resources of the same kind share a name inside one global snapshot
    #[error("Duplicate {kind} resource '{name}' in global snapshot")]
    DuplicateResource { kind: &'static str, name: String },

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a duplicate resource error
    pub fn duplicate_resource<S: Into<String>>(kind: &'static str, name: S) -> Self {
        Self::DuplicateResource { kind, name: name.into() }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_resource_message_names_kind_and_resource() {
        let err = Error::duplicate_resource("cluster", "payments");
        assert_eq!(err.to_string(), "Duplicate cluster resource 'payments' in global snapshot");
    }

    #[test]
    fn helper_constructors_pick_matching_variants() {
        assert!(matches!(Error::config("x"), Error::Config(_)));
        assert!(matches!(Error::validation("x"), Error::Validation(_)));
        assert!(matches!(Error::internal("x"), Error::Internal(_)));
    }
}
