//! Core error types.
//!
//! Row- and field-level read failures are never errors; they degrade to
//! omission. Everything that does abort a request is one of the variants
//! below.

use thiserror::Error;

/// Core engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Class-level, field-write, or master-required violation.
    ///
    /// Deliberately carries no reason.
    #[error("permission denied")]
    Permission,

    /// Malformed or unknown input.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Optimistic concurrency failure.
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// Storage backend failure, passed through.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Failure raised by a trigger.
    #[error("trigger error: {0}")]
    Trigger(String),

    /// File store failure.
    #[error("file store error: {0}")]
    FileStore(String),
}

/// Validation errors. Raised before any write reaches the backend.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Class is not defined in the schema.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// Path segment is not defined on the class.
    #[error("unknown field {path} on class {class}")]
    UnknownField {
        /// Class the path was resolved against.
        class: String,
        /// The offending path.
        path: String,
    },

    /// Path is syntactically invalid.
    #[error("malformed path: {0}")]
    MalformedPath(String),

    /// `$` used outside a quantifier sub-filter.
    #[error("placeholder `$` is only valid inside some/every: {0}")]
    PlaceholderOutsideQuantifier(String),

    /// Literal payload nests deeper than allowed.
    #[error("literal payload is cyclic or nested deeper than {0} levels")]
    CyclicLiteral(usize),

    /// Value does not match the field type.
    #[error("type mismatch for {path}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Field path.
        path: String,
        /// Expected type.
        expected: String,
        /// Actual value type.
        actual: String,
    },

    /// Argument is not acceptable for the operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is missing a required argument.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    /// Schema definition is inconsistent.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

/// Concurrency conflicts. Retryable under repeatable transactions.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Stored row version differs from the expected one.
    #[error("version mismatch for {class}/{id}: expected {expected}, found {actual}")]
    VersionMismatch {
        /// Class name.
        class: String,
        /// Object id.
        id: String,
        /// Expected version.
        expected: u64,
        /// Stored version.
        actual: u64,
    },

    /// Transaction commit lost a write race.
    #[error("transaction serialization failure: {0}")]
    Serialization(String),
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// sled failure.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Record encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insert collided with an existing id.
    #[error("duplicate id {id} in class {class}")]
    DuplicateId {
        /// Class name.
        class: String,
        /// Object id.
        id: String,
    },

    /// Transaction session is unknown or closed.
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Backend(BackendError::Storage(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Backend(BackendError::Serialization(e))
    }
}

impl From<acldb_proto::Error> for Error {
    fn from(e: acldb_proto::Error) -> Self {
        Error::Validation(ValidationError::InvalidArgument(e.to_string()))
    }
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PermissionDenied,
    UnknownClass,
    UnknownField,
    InvalidInput,
    VersionConflict,
    TransactionConflict,
    Backend,
    Trigger,
    FileStore,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::UnknownClass => "unknown_class",
            ErrorCode::UnknownField => "unknown_field",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::VersionConflict => "version_conflict",
            ErrorCode::TransactionConflict => "transaction_conflict",
            ErrorCode::Backend => "backend",
            ErrorCode::Trigger => "trigger",
            ErrorCode::FileStore => "file_store",
        }
    }
}

impl Error {
    /// Machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Permission => ErrorCode::PermissionDenied,
            Error::Validation(ValidationError::UnknownClass(_)) => ErrorCode::UnknownClass,
            Error::Validation(ValidationError::UnknownField { .. }) => ErrorCode::UnknownField,
            Error::Validation(_) => ErrorCode::InvalidInput,
            Error::Conflict(ConflictError::VersionMismatch { .. }) => ErrorCode::VersionConflict,
            Error::Conflict(ConflictError::Serialization(_)) => ErrorCode::TransactionConflict,
            Error::Backend(_) => ErrorCode::Backend,
            Error::Trigger(_) => ErrorCode::Trigger,
            Error::FileStore(_) => ErrorCode::FileStore,
        }
    }

    /// Check if a repeatable transaction should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_message_is_flat() {
        assert_eq!(Error::Permission.to_string(), "permission denied");
        assert_eq!(Error::Permission.code().as_str(), "permission_denied");
    }

    #[test]
    fn test_only_conflicts_retry() {
        let conflict: Error = ConflictError::Serialization("lost race".into()).into();
        assert!(conflict.is_retryable());
        assert!(!Error::Permission.is_retryable());
        let validation: Error = ValidationError::MissingArgument("update").into();
        assert!(!validation.is_retryable());
        assert_eq!(validation.code(), ErrorCode::InvalidInput);
    }
}
