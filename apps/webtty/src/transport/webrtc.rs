use super::DataChannel;
use crate::protocol::Frame;
use crate::session::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(30);

fn build_api() -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(SessionError::transport)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(SessionError::transport)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub async fn new_peer_connection(
    stun_servers: &[String],
) -> Result<Arc<RTCPeerConnection>, SessionError> {
    let urls: Vec<String> = stun_servers
        .iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();
    let ice_servers = if urls.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls,
            ..Default::default()
        }]
    };

    let api = build_api()?;
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?,
    );

    pc.on_ice_connection_state_change(Box::new(|state: RTCIceConnectionState| {
        Box::pin(async move {
            debug!(target = "webtty::transport", ice_state = %state, "ice connection state changed");
        })
    }));

    Ok(pc)
}

/// Applies `description` locally and blocks until ICE gathering completes,
/// returning the final SDP with every candidate inlined. The exchange is a
/// single round, so a partial description is useless to the peer.
pub async fn gather_local_description(
    pc: &Arc<RTCPeerConnection>,
    description: RTCSessionDescription,
) -> Result<String, SessionError> {
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(description).await?;

    trace!(target = "webtty::transport", "waiting for ice gathering");
    timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
        .await
        .map_err(|_| {
            SessionError::Transport(format!(
                "ice gathering did not complete within {ICE_GATHER_TIMEOUT:?}"
            ))
        })?;

    let local = pc.local_description().await.ok_or_else(|| {
        SessionError::Transport("failed to obtain local description".into())
    })?;
    debug!(target = "webtty::transport", sdp_len = local.sdp.len(), "ice gathering complete");
    Ok(local.sdp)
}

pub fn frame_from_message(message: DataChannelMessage) -> Frame {
    if message.is_string {
        Frame::Text(String::from_utf8_lossy(&message.data).into_owned())
    } else {
        Frame::Binary(message.data)
    }
}

pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    pub fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    async fn send_binary(&self, bytes: Bytes) -> Result<(), SessionError> {
        self.inner.send(&bytes).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.inner.send_text(text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_keep_their_kind() {
        let text = frame_from_message(DataChannelMessage {
            is_string: true,
            data: Bytes::from_static(b"quit"),
        });
        assert_eq!(text, Frame::text("quit"));

        let binary = frame_from_message(DataChannelMessage {
            is_string: false,
            data: Bytes::from_static(b"quit"),
        });
        assert_eq!(binary, Frame::binary(&b"quit"[..]));
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn peer_connection_without_stun_gathers_host_candidates() {
        let pc = new_peer_connection(&[]).await.unwrap();
        pc.create_data_channel("probe", None).await.unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        let sdp = gather_local_description(&pc, offer).await.unwrap();
        assert!(sdp.contains("m=application"));
        pc.close().await.unwrap();
    }
}
