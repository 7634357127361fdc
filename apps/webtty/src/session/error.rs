use crate::protocol::ProtocolError;
use crate::relay::RelayError;
use crate::signaling::{CryptoError, SignalingError};
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no answer arrived through the relay within {waited:?}")]
    RelayTimeout { waited: Duration },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("interrupted")]
    Interrupted,
}

impl SessionError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::ProtocolViolation(err.0)
    }
}

impl From<RelayError> for SessionError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Timeout { waited } => SessionError::RelayTimeout { waited },
            other => SessionError::Transport(other.to_string()),
        }
    }
}

impl From<::webrtc::Error> for SessionError {
    fn from(err: ::webrtc::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}
