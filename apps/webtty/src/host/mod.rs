//! Host side of a session: publishes the offer, runs a command under a pty
//! and serves it over the data channel.

pub mod pty;

use crate::protocol::{Frame, HostCommand, WindowSize, parse_host_frame};
use crate::relay::{RelayTransport, generate_address};
use crate::session::tty::{initial_pty_size, pump_reader};
use crate::session::{Readiness, Session, SessionError};
use crate::signaling::{self, ConnectionDescription, generate_key_material};
use crate::transport::webrtc::{RtcDataChannel, frame_from_message, gather_local_description};
use bytes::Bytes;
use parking_lot::Mutex;
use pty::{PtyControl, PtyProcess};
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PTY_READ_CHUNK: usize = 4096;
const STDIN_READ_CHUNK: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Init,
    OfferReady,
    AwaitingAnswer,
    Connected,
    Closed,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Init => "init",
            HostState::OfferReady => "offer_ready",
            HostState::AwaitingAnswer => "awaiting_answer",
            HostState::Connected => "connected",
            HostState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Where the answer token comes from.
#[derive(Debug, Clone)]
pub enum AnswerSource {
    /// Token already supplied by the operator.
    Token(String),
    /// One line read from stdin.
    Prompt,
    /// The relay address published in the offer.
    Relay,
}

#[derive(Clone)]
pub struct HostConfig {
    pub command: Vec<String>,
    pub one_way: bool,
    pub non_interactive: bool,
    pub relay: Option<RelayTransport>,
    pub relay_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            one_way: false,
            non_interactive: false,
            relay: None,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }
}

/// `$SHELL -l`, or `bash -l` when no shell is configured.
pub fn default_command() -> Vec<String> {
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty())
        .unwrap_or_else(|| "bash".to_string());
    vec![shell, "-l".to_string()]
}

pub struct HostSession {
    session: Arc<Session>,
    config: HostConfig,
    pty: Mutex<Option<Box<dyn PtyControl>>>,
    pty_ready: Readiness,
    state: Mutex<HostState>,
}

impl HostSession {
    pub fn new(session: Arc<Session>, config: HostConfig) -> Arc<Self> {
        Arc::new(Self {
            session,
            config,
            pty: Mutex::new(None),
            pty_ready: Readiness::new(),
            state: Mutex::new(HostState::Init),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> HostState {
        *self.state.lock()
    }

    fn transition(&self, next: HostState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(target = "webtty::host", from = %*state, to = %next, "host state transition");
            *state = next;
        }
    }

    /// Whether the host terminal mirrors the session.
    fn echoes_locally(&self) -> bool {
        !self.config.non_interactive && self.session.is_interactive()
    }

    /// Builds the offer and returns its token. Blocks until ICE gathering
    /// completes so the token carries every candidate.
    pub async fn create_offer(self: &Arc<Self>) -> Result<String, SessionError> {
        let pc = self.session.peer_connection()?;

        let host = Arc::downgrade(self);
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let host = host.clone();
            Box::pin(async move {
                if let Some(host) = host.upgrade() {
                    host.register_channel(channel);
                }
            })
        }));

        // Without a channel of its own the offer has no application section.
        pc.create_data_channel("offerer-channel", None).await?;
        let offer = pc.create_offer(None).await?;
        let sdp = gather_local_description(pc, offer).await?;

        let mut description = ConnectionDescription::new(sdp);
        if self.config.one_way {
            description.attach_key_material(&generate_key_material());
            description.encrypt()?;
            description.relay_address = Some(generate_address());
        }
        let token = signaling::encode(&description)?;
        self.session.set_offer(description);
        self.transition(HostState::OfferReady);
        info!(
            target = "webtty::host",
            one_way = self.config.one_way,
            token_len = token.len(),
            "offer ready"
        );
        Ok(token)
    }

    /// Obtains, decodes and stores the answer.
    pub async fn await_answer(
        &self,
        source: AnswerSource,
    ) -> Result<ConnectionDescription, SessionError> {
        let offer = self
            .session
            .offer()
            .ok_or_else(|| SessionError::Transport("no offer has been created".into()))?;
        self.transition(HostState::AwaitingAnswer);

        let token = match source {
            AnswerSource::Token(token) => signaling::resolve_token(&token)?,
            AnswerSource::Prompt => read_answer_line().await?,
            AnswerSource::Relay => {
                let address = offer.relay_address.as_deref().ok_or_else(|| {
                    SessionError::Transport("offer has no relay address".into())
                })?;
                let relay = self.config.relay.as_ref().ok_or_else(|| {
                    SessionError::Transport("no relay configured for a one-way offer".into())
                })?;
                info!(target = "webtty::host", "waiting for the answer on the relay");
                relay.poll(address, self.config.relay_timeout).await?
            }
        };

        let mut answer = signaling::decode(&token)?;
        if answer.has_key_material() {
            answer.decrypt()?;
            answer.strip_key_material();
        } else if offer.has_key_material() {
            answer.sdp = offer.key_material()?.open_answer(&answer.sdp)?;
        }
        debug!(target = "webtty::host", sdp_len = answer.sdp.len(), "answer received");
        self.session.set_answer(answer.clone());
        Ok(answer)
    }

    /// Applies the stored answer as the remote description.
    pub async fn apply_answer(&self) -> Result<(), SessionError> {
        let answer = self
            .session
            .answer()
            .ok_or_else(|| SessionError::Transport("no answer has been received".into()))?;
        let description = RTCSessionDescription::answer(answer.sdp)?;
        self.session
            .peer_connection()?
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    /// Applies the answer and waits for the session to end, cleaning up once.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if let Err(err) = self.apply_answer().await {
            self.session.settle(Err(err));
        }
        let outcome = self.session.wait_and_cleanup().await;
        // Dropping the process kills the command if it is still running.
        self.pty.lock().take();
        self.transition(HostState::Closed);
        outcome
    }

    fn register_channel(self: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        debug!(target = "webtty::host", label = %channel.label(), "peer opened data channel");
        self.session
            .attach_data_channel(Arc::new(RtcDataChannel::new(channel.clone())));

        let host = Arc::downgrade(self);
        channel.on_open(Box::new(move || {
            let host = host.clone();
            Box::pin(async move {
                if let Some(host) = host.upgrade() {
                    if let Err(err) = host.start_terminal() {
                        warn!(target = "webtty::host", error = %err, "failed to start terminal");
                        host.session.settle(Err(err));
                    }
                }
            })
        }));

        let host = Arc::downgrade(self);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let host = host.clone();
            Box::pin(async move {
                if let Some(host) = host.upgrade() {
                    host.handle_frame(frame_from_message(message)).await;
                }
            })
        }));

        let host: Weak<Self> = Arc::downgrade(self);
        channel.on_close(Box::new(move || {
            let host = host.clone();
            Box::pin(async move {
                if let Some(host) = host.upgrade() {
                    host.session
                        .settle(Err(SessionError::Transport("data channel closed".into())));
                }
            })
        }));
    }

    /// Runs when the data channel opens: spawns the command and starts the
    /// pumps around it.
    fn start_terminal(self: &Arc<Self>) -> Result<(), SessionError> {
        let size = initial_pty_size(self.session.terminal());
        let (process, reader) = PtyProcess::spawn(&self.config.command, size)
            .map_err(|err| SessionError::Io(io::Error::other(format!("{err:#}"))))?;
        self.attach_pty(Box::new(process));
        self.transition(HostState::Connected);
        info!(
            target = "webtty::host",
            command = ?self.config.command,
            rows = size.rows,
            cols = size.cols,
            "terminal session started"
        );

        let echo = self.echoes_locally();
        if echo {
            self.session.enable_raw_mode()?;
            self.spawn_stdin_pump()?;
        }
        self.spawn_interrupt_listener();
        self.spawn_output_pump(reader, echo)?;
        Ok(())
    }

    /// Installs the pty and releases messages waiting for it.
    pub fn attach_pty(&self, pty: Box<dyn PtyControl>) {
        *self.pty.lock() = Some(pty);
        self.pty_ready.mark_ready();
    }

    fn write_pty(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.pty.lock();
        let pty = guard
            .as_mut()
            .ok_or_else(|| SessionError::Transport("pty is not running".into()))?;
        pty.write_all(bytes)?;
        Ok(())
    }

    fn resize_pty(&self, size: WindowSize) -> Result<(), SessionError> {
        let mut guard = self.pty.lock();
        let pty = guard
            .as_mut()
            .ok_or_else(|| SessionError::Transport("pty is not running".into()))?;
        pty.resize(size)?;
        debug!(target = "webtty::host", rows = size.rows, cols = size.cols, "pty resized");
        Ok(())
    }

    /// Applies one inbound frame. Frames that arrive before the pty exists
    /// wait for it.
    pub async fn handle_frame(&self, frame: Frame) {
        self.pty_ready.wait().await;
        let result = match parse_host_frame(frame) {
            Ok(HostCommand::Input(bytes)) if bytes.is_empty() => Ok(()),
            Ok(HostCommand::Input(bytes)) => {
                trace!(target = "webtty::host", bytes = bytes.len(), "peer input");
                self.write_pty(&bytes)
            }
            Ok(HostCommand::Resize(size)) if size.rows == 0 || size.cols == 0 => {
                debug!(
                    target = "webtty::host",
                    rows = size.rows,
                    cols = size.cols,
                    "ignoring empty window size"
                );
                Ok(())
            }
            Ok(HostCommand::Resize(size)) => self.resize_pty(size),
            Ok(HostCommand::Quit) => {
                debug!(target = "webtty::host", "peer quit");
                self.session.settle(Ok(()));
                Ok(())
            }
            Err(err) => {
                warn!(target = "webtty::host", error = %err, "unexpected control message");
                Err(err.into())
            }
        };
        if let Err(err) = result {
            self.session.settle(Err(err));
        }
    }

    fn spawn_output_pump(
        self: &Arc<Self>,
        reader: Box<dyn io::Read + Send>,
        echo: bool,
    ) -> Result<(), SessionError> {
        let mut output = pump_reader("webtty-pty-reader", reader, PTY_READ_CHUNK)?;
        let channel = self
            .session
            .data_channel()
            .ok_or_else(|| SessionError::Transport("data channel missing".into()))?;
        let session = self.session.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    // Linux reports a closed pty as EIO once the command exits.
                    Err(err) if err.raw_os_error() == Some(EIO) => break,
                    Err(err) => {
                        session.settle(Err(err.into()));
                        return;
                    }
                };
                if echo {
                    if let Err(err) = echo_locally(&chunk) {
                        session.settle(Err(err.into()));
                        return;
                    }
                }
                if let Err(err) = channel.send_binary(chunk).await {
                    session.settle(Err(err));
                    return;
                }
                if session.is_terminated() {
                    return;
                }
            }
            debug!(target = "webtty::host", "command exited");
            session.settle(Ok(()));
        });
        Ok(())
    }

    fn spawn_stdin_pump(self: &Arc<Self>) -> Result<(), SessionError> {
        let stdin = Box::new(io::stdin());
        let mut input = pump_reader("webtty-stdin", stdin, STDIN_READ_CHUNK)?;
        let host = self.clone();
        tokio::spawn(async move {
            while let Some(chunk) = input.recv().await {
                if host.session.is_terminated() {
                    return;
                }
                let result = chunk
                    .map_err(SessionError::from)
                    .and_then(|chunk| host.write_pty(&chunk));
                if let Err(err) = result {
                    host.session.settle(Err(err));
                    return;
                }
            }
            debug!(target = "webtty::host", "local stdin closed");
        });
        Ok(())
    }

    fn spawn_interrupt_listener(&self) {
        let session = self.session.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    debug!(target = "webtty::host", "interrupt received");
                    session.settle(Err(SessionError::Interrupted));
                }
                Err(err) => {
                    warn!(target = "webtty::host", error = %err, "failed to listen for ctrl-c");
                }
            }
        });
    }
}

const EIO: i32 = 5;

fn echo_locally(bytes: &Bytes) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(bytes)?;
    stdout.flush()
}

async fn read_answer_line() -> Result<String, SessionError> {
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .map_err(SessionError::transport)??;
    Ok(signaling::resolve_token(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingPty, ScriptedTerminal};
    use crate::relay::MemoryRelay;
    use crate::session::SessionConfig;
    use std::time::Duration;

    fn detached_host() -> Arc<HostSession> {
        let session = Arc::new(Session::detached(Box::new(ScriptedTerminal::detached())));
        HostSession::new(session, HostConfig::default())
    }

    fn host_with_pty() -> (Arc<HostSession>, RecordingPty) {
        let host = detached_host();
        let pty = RecordingPty::new();
        host.attach_pty(Box::new(pty.clone()));
        (host, pty)
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn set_size_resizes_the_pty() {
        let (host, pty) = host_with_pty();
        host.handle_frame(Frame::text(r#"["set_size",40,120]"#)).await;
        assert_eq!(pty.last_size(), Some(WindowSize::new(40, 120)));
        assert!(!host.session().is_terminated());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn uncommon_set_size_shapes_keep_the_session() {
        let (host, pty) = host_with_pty();
        host.handle_frame(Frame::text(r#"["set_size",0,0]"#)).await;
        host.handle_frame(Frame::text(r#"["set_size",30,90,640]"#)).await;
        host.handle_frame(Frame::text(r#"["set_size",0,90,640,480]"#)).await;
        assert_eq!(pty.sizes(), vec![WindowSize::new(30, 90)]);
        assert!(!host.session().is_terminated());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn stdin_writes_exact_bytes() {
        let (host, pty) = host_with_pty();
        host.handle_frame(Frame::text(r#"["stdin","ls\n"]"#)).await;
        assert_eq!(pty.written(), b"ls\n");
        assert_eq!(pty.write_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn binary_frames_go_straight_to_the_pty() {
        let (host, pty) = host_with_pty();
        host.handle_frame(Frame::binary(&b"\x03"[..])).await;
        host.handle_frame(Frame::binary(Bytes::new())).await;
        host.handle_frame(Frame::text(r#"["stdin",""]"#)).await;
        assert_eq!(pty.written(), b"\x03");
        assert_eq!(pty.write_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn quit_twice_ends_cleanly() {
        let (host, _pty) = host_with_pty();
        host.handle_frame(Frame::text("quit")).await;
        host.handle_frame(Frame::text("quit")).await;
        assert!(host.session().wait_and_cleanup().await.is_ok());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn unknown_text_is_a_protocol_violation() {
        let (host, _pty) = host_with_pty();
        host.handle_frame(Frame::text("ping")).await;
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            host.session().termination().wait(),
        )
        .await
        .expect("termination settled");
        assert!(matches!(outcome, Err(SessionError::ProtocolViolation(_))));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn frames_wait_for_the_pty() {
        let host = detached_host();
        let pending = {
            let host = host.clone();
            tokio::spawn(async move { host.handle_frame(Frame::text(r#"["stdin","x"]"#)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());

        let pty = RecordingPty::new();
        host.attach_pty(Box::new(pty.clone()));
        pending.await.unwrap();
        assert_eq!(pty.written(), b"x");
    }

    #[test]
    fn default_command_is_a_login_shell() {
        let command = default_command();
        assert_eq!(command.len(), 2);
        assert_eq!(command[1], "-l");
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn answer_requires_an_offer() {
        let host = detached_host();
        let err = host
            .await_answer(AnswerSource::Token("anything".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(host.state(), HostState::Init);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn one_way_offer_is_sealed_and_addressed() {
        let config = SessionConfig {
            stun_servers: Vec::new(),
        };
        let session = Arc::new(
            Session::init_with_terminal(&config, Box::new(ScriptedTerminal::detached()))
                .await
                .unwrap(),
        );
        let host = HostSession::new(
            session.clone(),
            HostConfig {
                one_way: true,
                relay: Some(RelayTransport::new(Arc::new(MemoryRelay::new()))),
                ..HostConfig::default()
            },
        );

        let token = host.create_offer().await.unwrap();
        assert_eq!(host.state(), HostState::OfferReady);

        let mut offer = signaling::decode(&token).unwrap();
        assert!(offer.has_key_material());
        assert_eq!(offer.relay_address.as_ref().map(String::len), Some(100));
        assert!(!offer.sdp.contains("m=application"));
        offer.decrypt().unwrap();
        assert!(offer.sdp.contains("m=application"));

        session.peer_connection().unwrap().close().await.unwrap();
    }
}
