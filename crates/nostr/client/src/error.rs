//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Identity(#[from] nostr::IdentityError),

    #[error(transparent)]
    Event(#[from] nostr::Nip01Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,

    #[error("relay task closed: {0}")]
    RelayClosed(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
