pub mod webrtc;

use crate::session::SessionError;
use async_trait::async_trait;
use bytes::Bytes;

/// The open bidirectional channel between the two peers.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    async fn send_binary(&self, bytes: Bytes) -> Result<(), SessionError>;

    async fn send_text(&self, text: String) -> Result<(), SessionError>;
}
