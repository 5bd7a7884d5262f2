// src/error.rs

//! Error types for the build engine
//!
//! One enum covers every component. `Error::category()` groups variants the
//! way the CLI reports them: user input problems are shown with their
//! location, dependency failures can be retried, and state inconsistencies
//! require the store to be reloaded.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure class used for reporting and exit handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    UserInput,
    MissingDependency,
    Io,
    PolicyDenied,
    StateInconsistent,
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserInput => "user-input",
            ErrorCategory::MissingDependency => "missing-dependency",
            ErrorCategory::Io => "io",
            ErrorCategory::PolicyDenied => "policy-denied",
            ErrorCategory::StateInconsistent => "state-inconsistent",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed recipe document
    #[error("line {line}: {context}: {message}")]
    Parse {
        line: usize,
        context: String,
        message: String,
    },

    /// Recipe parsed but violates a structural rule
    #[error("invalid {entity}: {message}")]
    Validation { entity: String, message: String },

    /// Requested platform/architecture is not declared by the recipe
    #[error("unsupported target {platform}/{arch}: {reason}")]
    UnsupportedTarget {
        platform: String,
        arch: String,
        reason: String,
    },

    /// Command line misuse
    #[error("usage: {0}")]
    Usage(String),

    /// Ingredient, toolchain or host package could not be provided
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Access refused by the policy evaluator
    #[error("policy denied {hook} on {target}")]
    PolicyDenied { hook: String, target: String },

    /// A deferred-operation flush failed; the store must be reloaded
    #[error("state store inconsistent: {0}")]
    StateInconsistent(String),

    #[error("container error: {0}")]
    ContainerError(String),

    /// A spawned build command exited unsuccessfully
    #[error("{step} failed with exit code {code}")]
    StepFailed { step: String, code: i32 },

    #[error("invalid limit '{value}': {reason}")]
    InvalidLimit { value: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("pack error: {0}")]
    PackError(String),

    #[error("operation cancelled by signal {0}")]
    Cancelled(i32),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Build a parse error at a given source line
    pub fn parse(line: usize, context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            context: context.into(),
            message: message.into(),
        }
    }

    /// Build a validation error for a named entity
    pub fn validation(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Parse { .. }
            | Error::Validation { .. }
            | Error::UnsupportedTarget { .. }
            | Error::Usage(_)
            | Error::InvalidLimit { .. } => ErrorCategory::UserInput,
            Error::MissingDependency(_) | Error::NotFound(_) | Error::RemoteError(_) => {
                ErrorCategory::MissingDependency
            }
            Error::IoError(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::ContainerError(_)
            | Error::StepFailed { .. }
            | Error::PackError(_)
            | Error::Cancelled(_) => ErrorCategory::Io,
            Error::PolicyDenied { .. } => ErrorCategory::PolicyDenied,
            Error::StateInconsistent(_) | Error::Database(_) => ErrorCategory::StateInconsistent,
            Error::Fatal(_) => ErrorCategory::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = Error::parse(12, "recipes.steps", "unknown key 'sytem'");
        assert_eq!(err.to_string(), "line 12: recipes.steps: unknown key 'sytem'");
        assert_eq!(err.category(), ErrorCategory::UserInput);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::MissingDependency("vali/clang".into()).category(),
            ErrorCategory::MissingDependency
        );
        assert_eq!(
            Error::StateInconsistent("flush".into()).category(),
            ErrorCategory::StateInconsistent
        );
        let io: Error = std::io::Error::other("boom").into();
        assert_eq!(io.category(), ErrorCategory::Io);
    }
}
