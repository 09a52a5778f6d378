//! Error taxonomy shared by every layer of the client.

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a repository
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Item already exists: {0}")]
    ItemExists(String),

    #[error("Invalid item state: {0}")]
    InvalidItemState(String),

    #[error("Session is no longer live")]
    SessionClosed,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The server refused a batched multi-path read.
    #[error("Batched read rejected by server: {0}")]
    BatchReadRejected(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Value format error: {0}")]
    ValueFormat(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Repository error: {0}")]
    Protocol(String),
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Item or path does not exist.
    NotFound,
    /// Target already exists.
    Exists,
    /// Operation needs a clean item (or a live session).
    State,
    /// Operation unsupported by this backend.
    Capability,
    /// Lock conflict or access-control denial.
    Access,
    /// Malformed or unexpected server response; catch-all.
    Protocol,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ItemNotFound(_) | Error::PathNotFound(_) => ErrorKind::NotFound,
            Error::ItemExists(_) => ErrorKind::Exists,
            Error::InvalidItemState(_) | Error::SessionClosed => ErrorKind::State,
            Error::Unsupported(_) | Error::BatchReadRejected(_) | Error::Namespace(_) => {
                ErrorKind::Capability
            }
            Error::LockConflict(_) | Error::AccessDenied(_) => ErrorKind::Access,
            Error::ValueFormat(_)
            | Error::InvalidPath(_)
            | Error::Http { .. }
            | Error::Xml(_)
            | Error::Json(_)
            | Error::Protocol(_) => ErrorKind::Protocol,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Shorthand for a capability error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
