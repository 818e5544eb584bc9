use std::io;

use gfweb_core::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot create directory {dir}: {reason}")]
    DirCreate { dir: String, reason: String },
    #[error("{dir}: {reason}")]
    Permission { dir: String, reason: String },
    #[error("{0}")]
    Remote(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no local source for {0}")]
    MissingSource(String),
    #[error("invalid local target: {0}")]
    InvalidTarget(String),
    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Text shown on the task card.
    pub fn user_message(&self) -> String {
        match self {
            TransferError::Api(err) => err.user_message(),
            other => other.to_string(),
        }
    }
}
