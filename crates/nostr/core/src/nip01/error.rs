use crate::identity::IdentityError;
use thiserror::Error;

/// NIP-01 error types
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("missing event field: {0}")]
    MissingField(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

pub type Result<T> = std::result::Result<T, Nip01Error>;
