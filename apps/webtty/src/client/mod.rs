//! Joining side of a session: answers an offer and attaches the local
//! terminal to the remote command.

use crate::protocol::{ClientCommand, Frame, parse_client_frame, set_size_message};
use crate::relay::RelayTransport;
use crate::session::tty::pump_reader;
use crate::session::{Session, SessionError};
use crate::signaling::{self, ConnectionDescription};
use crate::transport::DataChannel;
use crate::transport::webrtc::{RtcDataChannel, frame_from_message, gather_local_description};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const DATA_CHANNEL_LABEL: &str = "data";
const MAX_PACKET_LIFE_TIME_MS: u16 = 1000;
const STDIN_READ_CHUNK: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Init,
    OfferDecoded,
    AnswerSent,
    Connected,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Init => "init",
            ClientState::OfferDecoded => "offer_decoded",
            ClientState::AnswerSent => "answer_sent",
            ClientState::Connected => "connected",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Where the answer token went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerDelivery {
    /// Uploaded to the relay address named in the offer.
    Relayed,
    /// Must be handed to the host by the operator.
    Manual,
}

pub struct ClientSession {
    session: Arc<Session>,
    offer_token: String,
    relay: Option<RelayTransport>,
    output: Mutex<Box<dyn Write + Send>>,
    state: Mutex<ClientState>,
}

impl ClientSession {
    pub fn new(
        session: Arc<Session>,
        offer_token: impl Into<String>,
        relay: Option<RelayTransport>,
    ) -> Arc<Self> {
        Self::with_output(session, offer_token, relay, Box::new(io::stdout()))
    }

    /// Like [`ClientSession::new`] but remote output goes to `output`.
    pub fn with_output(
        session: Arc<Session>,
        offer_token: impl Into<String>,
        relay: Option<RelayTransport>,
        output: Box<dyn Write + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            offer_token: offer_token.into(),
            relay,
            output: Mutex::new(output),
            state: Mutex::new(ClientState::Init),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn transition(&self, next: ClientState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(target = "webtty::client", from = %*state, to = %next, "client state transition");
            *state = next;
        }
    }

    /// Opens the data channel, accepts the offer and returns the answer
    /// token.
    pub async fn create_answer(self: &Arc<Self>) -> Result<String, SessionError> {
        self.open_channel().await?;
        let offer = self.decode_offer()?;

        let pc = self.session.peer_connection()?;
        pc.set_remote_description(RTCSessionDescription::offer(offer.sdp.clone())?)
            .await?;
        let answer = pc.create_answer(None).await?;
        let sdp = gather_local_description(pc, answer).await?;

        let answer = seal_answer(sdp, &offer)?;
        let token = signaling::encode(&answer)?;
        self.session.set_answer(answer);
        info!(
            target = "webtty::client",
            sealed = offer.has_key_material(),
            token_len = token.len(),
            "answer ready"
        );
        Ok(token)
    }

    async fn open_channel(self: &Arc<Self>) -> Result<(), SessionError> {
        let pc = self.session.peer_connection()?;
        let channel = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_packet_life_time: Some(MAX_PACKET_LIFE_TIME_MS),
                    ..Default::default()
                }),
            )
            .await?;
        self.session
            .attach_data_channel(Arc::new(RtcDataChannel::new(channel.clone())));

        let client = Arc::downgrade(self);
        channel.on_open(Box::new(move || {
            let client = client.clone();
            Box::pin(async move {
                if let Some(client) = client.upgrade() {
                    if let Err(err) = client.start_terminal().await {
                        warn!(target = "webtty::client", error = %err, "failed to start terminal");
                        client.session.settle(Err(err));
                    }
                }
            })
        }));

        let client = Arc::downgrade(self);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let client = client.clone();
            Box::pin(async move {
                if let Some(client) = client.upgrade() {
                    client.handle_frame(frame_from_message(message));
                }
            })
        }));

        let client = Arc::downgrade(self);
        channel.on_close(Box::new(move || {
            let client = client.clone();
            Box::pin(async move {
                if let Some(client) = client.upgrade() {
                    client
                        .session
                        .settle(Err(SessionError::Transport("data channel closed".into())));
                }
            })
        }));
        Ok(())
    }

    /// Decodes the offer token, opening sealed offers, and stores the
    /// result.
    pub fn decode_offer(&self) -> Result<ConnectionDescription, SessionError> {
        let mut offer = signaling::decode(&self.offer_token)?;
        if offer.has_key_material() {
            offer.decrypt()?;
        }
        self.session.set_offer(offer.clone());
        self.transition(ClientState::OfferDecoded);
        Ok(offer)
    }

    /// Uploads the answer when the offer named a relay address; otherwise
    /// the operator carries it back.
    pub async fn deliver_answer(&self, token: &str) -> Result<AnswerDelivery, SessionError> {
        let address = self.session.offer().and_then(|offer| offer.relay_address);
        let delivery = match address {
            Some(address) => {
                let relay = self.relay.as_ref().ok_or_else(|| {
                    SessionError::Transport("offer names a relay but none is configured".into())
                })?;
                relay.upload(&address, token).await?;
                AnswerDelivery::Relayed
            }
            None => AnswerDelivery::Manual,
        };
        self.transition(ClientState::AnswerSent);
        Ok(delivery)
    }

    /// Waits for the session to end and cleans up once.
    pub async fn run(&self) -> Result<(), SessionError> {
        let outcome = self.session.wait_and_cleanup().await;
        self.transition(ClientState::Closed);
        outcome
    }

    async fn start_terminal(self: &Arc<Self>) -> Result<(), SessionError> {
        let channel = self
            .session
            .data_channel()
            .ok_or_else(|| SessionError::Transport("data channel missing".into()))?;
        self.transition(ClientState::Connected);
        info!(target = "webtty::client", label = %channel.label(), "terminal session started");

        if self.session.is_interactive() {
            self.session.enable_raw_mode()?;
        }
        let size = self.session.terminal().size().unwrap_or_default();
        channel.send_text(set_size_message(size)).await?;

        self.spawn_resize_listener(channel.clone());
        self.spawn_input_pump(channel)?;
        Ok(())
    }

    fn spawn_input_pump(&self, channel: Arc<dyn DataChannel>) -> Result<(), SessionError> {
        let mut input = pump_reader("webtty-stdin", Box::new(io::stdin()), STDIN_READ_CHUNK)?;
        let session = self.session.clone();
        tokio::spawn(async move {
            while let Some(chunk) = input.recv().await {
                if session.is_terminated() {
                    return;
                }
                let result = match chunk {
                    Ok(chunk) => channel.send_binary(chunk).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = result {
                    session.settle(Err(err));
                    return;
                }
            }
            debug!(target = "webtty::client", "local stdin closed");
        });
        Ok(())
    }

    #[cfg(unix)]
    fn spawn_resize_listener(&self, channel: Arc<dyn DataChannel>) {
        use tokio::signal::unix::{SignalKind, signal};

        let session = self.session.clone();
        tokio::spawn(async move {
            let mut window_changes = match signal(SignalKind::window_change()) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target = "webtty::client", error = %err, "cannot watch window size");
                    return;
                }
            };
            while window_changes.recv().await.is_some() {
                if session.is_terminated() {
                    return;
                }
                let Some(size) = session.terminal().size() else {
                    continue;
                };
                debug!(target = "webtty::client", rows = size.rows, cols = size.cols, "window resized");
                if let Err(err) = channel.send_text(set_size_message(size)).await {
                    session.settle(Err(err));
                    return;
                }
            }
        });
    }

    #[cfg(not(unix))]
    fn spawn_resize_listener(&self, _channel: Arc<dyn DataChannel>) {}

    /// Applies one frame from the host.
    pub fn handle_frame(&self, frame: Frame) {
        match parse_client_frame(frame) {
            Ok(ClientCommand::Output(bytes)) => {
                let mut output = self.output.lock();
                let written = output.write_all(&bytes).and_then(|_| output.flush());
                drop(output);
                if let Err(err) = written {
                    self.session.settle(Err(err.into()));
                }
            }
            Ok(ClientCommand::Quit) => {
                debug!(target = "webtty::client", "host quit");
                if let Err(err) = self.session.restore_terminal() {
                    warn!(target = "webtty::client", error = %err, "failed to restore terminal");
                }
                self.session.settle(Ok(()));
            }
            Err(err) => {
                warn!(target = "webtty::client", error = %err, "unexpected control message");
                self.session.settle(Err(err.into()));
            }
        }
    }
}

/// Builds the answer record. When the offer was sealed the answer is sealed
/// under the same key with the answer nonce; key material never travels
/// back.
pub fn seal_answer(
    sdp: String,
    offer: &ConnectionDescription,
) -> Result<ConnectionDescription, SessionError> {
    if !offer.has_key_material() {
        return Ok(ConnectionDescription::new(sdp));
    }
    let material = offer.key_material()?;
    let mut answer = ConnectionDescription::new(material.seal_answer(&sdp)?);
    answer.strip_key_material();
    Ok(answer)
}
