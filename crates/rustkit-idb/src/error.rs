//! Error kinds surfaced to the façade.

use thiserror::Error;

/// IndexedDB errors.
///
/// Each variant corresponds to a DOMException name; [`IDBError::name`]
/// returns it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IDBError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("Constraint error: {0}")]
    ConstraintError(String),

    #[error("Invalid state: {0}")]
    InvalidStateError(String),

    #[error("Transaction inactive")]
    TransactionInactiveError,

    #[error("Read only")]
    ReadOnlyError,

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Version error: {0}")]
    VersionError(String),

    #[error("Abort error: {0}")]
    AbortError(String),

    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Invalid access: {0}")]
    InvalidAccessError(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

impl IDBError {
    /// DOMException name of this error.
    pub fn name(&self) -> &'static str {
        match self {
            IDBError::DataError(_) => "DataError",
            IDBError::ConstraintError(_) => "ConstraintError",
            IDBError::InvalidStateError(_) => "InvalidStateError",
            IDBError::TransactionInactiveError => "TransactionInactiveError",
            IDBError::ReadOnlyError => "ReadOnlyError",
            IDBError::NotFoundError(_) => "NotFoundError",
            IDBError::VersionError(_) => "VersionError",
            IDBError::AbortError(_) => "AbortError",
            IDBError::SyntaxError(_) => "SyntaxError",
            IDBError::InvalidAccessError(_) => "InvalidAccessError",
            IDBError::TypeError(_) => "TypeError",
            IDBError::UnknownError(_) => "UnknownError",
        }
    }

    pub(crate) fn data(message: impl Into<String>) -> Self {
        Self::DataError(message.into())
    }

    pub(crate) fn constraint(message: impl Into<String>) -> Self {
        Self::ConstraintError(message.into())
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidStateError(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFoundError(message.into())
    }
}

impl From<rusqlite::Error> for IDBError {
    fn from(e: rusqlite::Error) -> Self {
        IDBError::UnknownError(format!("sqlite: {}", e))
    }
}

impl From<serde_json::Error> for IDBError {
    fn from(e: serde_json::Error) -> Self {
        IDBError::UnknownError(format!("serialization: {}", e))
    }
}

/// Result type alias for IndexedDB operations.
pub type Result<T> = std::result::Result<T, IDBError>;
