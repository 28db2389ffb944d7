//! Error types for wgmint

use thiserror::Error;

/// Result type alias using the wgmint Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgmint error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Public key already in use")]
    Conflict,

    #[error("No additional peers are allowed")]
    QuotaExceeded,

    #[error("`{command}` returned error: {stderr}")]
    Execution { command: String, stderr: String },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Client-input failures surface as a 4xx response with their reason
    /// string; everything else is a system fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Conflict | Error::QuotaExceeded
        )
    }
}

/// Client-input rejections, classified by which check failed. The display
/// strings are the stable reason strings returned to callers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Account length must be 15")]
    CodeLength,

    #[error("Invalid account characters")]
    CodeCharset,

    #[error("Account not found")]
    AccountNotFound,

    #[error("Account expired")]
    AccountExpired,

    #[error("Invalid pubkey length")]
    PubkeyLength,

    #[error("Invalid pubkey characters")]
    PubkeyCharset,

    #[error("Master account code required")]
    MasterRequired,

    #[error("Comment too long")]
    CommentTooLong,
}
