//! Error types and result types for resource operations.
//!
//! Every fallible operation in the resource layer returns [`ResourceResult<T>`]. The
//! variants of [`ResourceError`] are split into client faults (bad input, unknown or
//! expired transactions, unreachable collections) and server faults (store, staging log
//! or event log failures); see [`ResourceError::class`].

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

use crate::transform::CoercionKind;

/// Represents all possible errors that can occur when serving a resource request.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The collection is absent from the policy table or marked unreachable.
    #[error("Collection {0} is not reachable")]
    PolicyForbidden(String),
    /// The request has an invalid shape (unsupported operator, malformed id, ...).
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    /// A value could not be coerced into the form its transform rule declares.
    #[error("Cannot apply {kind} transform at {path}: {reason}")]
    TransformFailed {
        kind: CoercionKind,
        path: String,
        reason: String,
    },
    /// The transaction was never begun, has already been committed, or has expired.
    #[error("Transaction not found: {0}")]
    TxnNotFound(String),
    /// Commit was attempted after the transaction deadline.
    #[error("Transaction {0} timed out")]
    TxnTimedOut(String),
    /// Another caller is already committing the transaction.
    #[error("Transaction {0} is already being committed")]
    TxnAlreadyCommitting(String),
    /// A secret did not match its stored hash.
    #[error("Secret does not match")]
    SecretMismatch,
    /// The document store rejected the operation.
    #[error("Store error: {0}")]
    Store(String),
    /// A change event could not be published after the mutation took effect.
    #[error("Publish error: {0}")]
    Publish(String),
    /// The staging log could not be read or written.
    #[error("Staging log error: {0}")]
    Staging(String),
    /// Serialization/deserialization error when converting between formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The process configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Error during backend initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// Which side of the request is at fault.
///
/// Maps onto the HTTP 400 and 500 status classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Client,
    Server,
}

impl ResourceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ResourceError::PolicyForbidden(_)
            | ResourceError::ValidationFailed(_)
            | ResourceError::TransformFailed { .. }
            | ResourceError::TxnNotFound(_)
            | ResourceError::TxnTimedOut(_)
            | ResourceError::TxnAlreadyCommitting(_)
            | ResourceError::SecretMismatch => ErrorClass::Client,
            ResourceError::Store(_)
            | ResourceError::Publish(_)
            | ResourceError::Staging(_)
            | ResourceError::Serialization(_)
            | ResourceError::Configuration(_)
            | ResourceError::Initialization(_) => ErrorClass::Server,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.class() == ErrorClass::Client
    }
}

/// A specialized `Result` type for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

impl From<BsonError> for ResourceError {
    fn from(err: BsonError) -> Self {
        ResourceError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for ResourceError {
    fn from(err: SerdeJsonError) -> Self {
        ResourceError::Serialization(err.to_string())
    }
}
