//! Error types for the ContextVM core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    #[error("unauthorized sender: {0}")]
    Unauthorized(String),

    #[error("encryption policy mismatch: {0}")]
    EncryptionPolicyMismatch(String),

    #[error("no pending request for id {0}")]
    NoPendingRequest(String),

    #[error("no session tracks progress token {0}")]
    ProgressWithoutRequest(String),

    #[error("publish rejected by every relay")]
    RelayPublish,

    #[error("relay error: {0}")]
    Relay(String),

    #[error("key error: {0}")]
    Key(#[from] nostr::key::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
