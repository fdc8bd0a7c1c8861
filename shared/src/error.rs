//! Error types for Unilink.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("invalid body encoding: {0}")]
    Body(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for relay response")]
    ResponseTimeout,

    #[error("relay link is down")]
    LinkDown,
}
