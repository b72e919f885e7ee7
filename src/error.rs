// src/error.rs

//! Error types for the larder store
//!
//! A single crate-wide error enum keeps the surface small: mutation-level
//! failures (validation, attachment) abort only the offending call, while
//! load, save, and filesystem failures escape to the transaction
//! coordinator, which aborts the whole transaction.

use thiserror::Error;

/// Errors that can occur while using a store
#[derive(Error, Debug)]
pub enum Error {
    /// A field value was rejected (wrong type, disallowed null, coercion
    /// failure)
    #[error("invalid value for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// A field was read with no stored value and no default
    #[error("field '{0}' has no value and no default")]
    FieldUnset(String),

    /// A value that is not a persistent model was added to a folder
    #[error("value is not a persistent model")]
    NotAModel,

    /// A folder operation was invoked on a non-folder model
    #[error("model '{0}' is not a folder")]
    NotAFolder(String),

    /// A model that is live in the tree was inserted a second time
    #[error("model is already attached at '{path}'")]
    AlreadyAttached { path: String },

    /// Indexed access to a folder with an unknown or deleted name
    #[error("no child named '{0}'")]
    KeyMissing(String),

    /// A child name contains a separator, a dot component, a reserved name,
    /// or the document suffix
    #[error("invalid child name '{0}'")]
    InvalidName(String),

    /// A document could not be loaded (missing file, malformed content,
    /// unknown schema tag)
    #[error("failed to load document '{file}': {reason}")]
    Load { file: String, reason: String },

    /// Misconfiguration: blob operations without a blob store, reuse of a
    /// closed session, operations on detached trees
    #[error("{0}")]
    Configuration(String),

    /// Error surfaced from the transaction coordinator
    #[error("transaction error: {0}")]
    Transaction(String),

    /// I/O error from the underlying filesystem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
