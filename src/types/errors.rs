//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for strider.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (bad input, bad config, missing parameters).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (crew, machine, timer).
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists (duplicate crew, machine or timer id).
    #[error("already exists: {0}")]
    Exists(String),

    /// A spec was used before it was compiled.
    #[error("spec not compiled: {0}")]
    SpecNotCompiled(String),

    /// A state references a node the spec does not have.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// An action source was present but never compiled.
    #[error("uncompiled action at node {0}")]
    UncompiledAction(String),

    /// A node has both an action and message-typed branches.
    #[error("bad branching at node {0}: an action can't be followed by message branches")]
    BadBranching(String),

    /// A branches block declared a type other than "message" or "bindings".
    #[error("unknown branching type '{0}'")]
    UnknownBranchType(String),

    /// No interpreter registered under the requested name.
    #[error("no interpreter named '{0}'")]
    InterpreterNotFound(String),

    /// Action, guard or pattern compilation failed.
    #[error("compile error: {0}")]
    Compile(String),

    /// A map pattern mixes a variable key with other keys.
    #[error("bad property variable: {0}")]
    BadPropertyVariable(String),

    /// A list pattern uses more than one variable.
    #[error("list variables: {0}")]
    ListVariables(String),

    /// An unguarded branch pattern matched in more than one way.
    #[error("too many bindings ({0}) for branch without a guard")]
    TooManyBindings(usize),

    /// An action or guard failed while executing.
    #[error("action error: {0}")]
    Action(String),

    /// Persistence failures.
    #[error("storage error: {0}")]
    Storage(String),

    /// A spec source could not be resolved.
    #[error("spec source error: {0}")]
    SpecSource(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization/deserialization errors.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable short code used in operation responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::Exists(_) => "already_exists",
            Error::SpecNotCompiled(_)
            | Error::UnknownNode(_)
            | Error::UncompiledAction(_)
            | Error::Internal(_) => "internal",
            Error::BadBranching(_)
            | Error::UnknownBranchType(_)
            | Error::InterpreterNotFound(_)
            | Error::Compile(_) => "bad_spec",
            Error::BadPropertyVariable(_) | Error::ListVariables(_) => "bad_pattern",
            Error::TooManyBindings(_) => "ambiguous",
            Error::Action(_) => "action_failed",
            Error::Storage(_) => "unavailable",
            Error::SpecSource(_) => "spec_source",
            Error::Cancelled(_) => "cancelled",
            Error::Serialization(_) | Error::Yaml(_) => "invalid_argument",
            Error::Io(_) => "internal",
        }
    }

    /// Programmer or deployment errors (as opposed to errors a machine can
    /// reasonably recover from at its error node).
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::SpecNotCompiled(_)
                | Error::UnknownNode(_)
                | Error::UncompiledAction(_)
                | Error::Internal(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn exists(msg: impl Into<String>) -> Self {
        Self::Exists(msg.into())
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        Self::Compile(msg.into())
    }

    pub fn action(msg: impl Into<String>) -> Self {
        Self::Action(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn spec_source(msg: impl Into<String>) -> Self {
        Self::SpecSource(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::not_found("crew c").code(), "not_found");
        assert_eq!(Error::exists("timer t").code(), "already_exists");
        assert_eq!(Error::TooManyBindings(2).code(), "ambiguous");
        assert_eq!(Error::UnknownBranchType("x".into()).code(), "bad_spec");
    }

    #[test]
    fn test_internal_classification() {
        assert!(Error::UnknownNode("nope".into()).is_internal());
        assert!(Error::SpecNotCompiled("s".into()).is_internal());
        assert!(!Error::action("boom").is_internal());
        assert!(!Error::TooManyBindings(3).is_internal());
    }

    #[test]
    fn test_display() {
        let err = Error::UnknownBranchType("sideways".into());
        assert_eq!(err.to_string(), "unknown branching type 'sideways'");
    }
}
