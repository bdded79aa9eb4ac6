use thiserror::Error;

use crate::{auth::AuthError, frame::FrameError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The token was expired or unreadable; no socket was opened.
    #[error("invalid access token: {0}")]
    InvalidToken(#[from] AuthError),
    #[error("not connected")]
    NotConnected,
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection task has shut down")]
    ActorGone,
}
