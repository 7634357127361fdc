//! State shared by both ends of a terminal session.
//!
//! [`Session`] owns the peer connection, the data channel once it exists, the
//! settle-once [`Termination`] slot and the local terminal's raw-mode state.
//! The host and client roles each hold an `Arc<Session>` and layer their half
//! of the control protocol on top.

mod error;
pub mod termination;
pub mod tty;

pub use error::SessionError;
pub use termination::{Outcome, Readiness, Termination};
pub use tty::{LocalTerminal, TerminalMode};

use crate::protocol::QUIT;
use crate::signaling::ConnectionDescription;
use crate::transport::DataChannel;
use crate::transport::webrtc::{DEFAULT_STUN_SERVER, new_peer_connection};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;

/// Time given to the final `quit` frame before the peer connection closes.
const QUIT_FLUSH_GRACE: Duration = Duration::from_millis(150);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub stun_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

pub struct Session {
    peer_connection: Option<Arc<RTCPeerConnection>>,
    data_channel: Mutex<Option<Arc<dyn DataChannel>>>,
    offer: Mutex<Option<ConnectionDescription>>,
    answer: Mutex<Option<ConnectionDescription>>,
    termination: Termination,
    interactive: bool,
    terminal: Box<dyn TerminalMode>,
    raw_enabled: AtomicBool,
    cleaned_up: AtomicBool,
}

impl Session {
    /// Allocates the peer connection and termination slot for a session on
    /// the local terminal.
    pub async fn init(config: &SessionConfig) -> Result<Self, SessionError> {
        Self::init_with_terminal(config, Box::new(LocalTerminal)).await
    }

    pub async fn init_with_terminal(
        config: &SessionConfig,
        terminal: Box<dyn TerminalMode>,
    ) -> Result<Self, SessionError> {
        let peer_connection = new_peer_connection(&config.stun_servers).await?;
        let mut session = Self::detached(terminal);
        session.peer_connection = Some(peer_connection);
        Ok(session)
    }

    /// A session with no peer connection; the data channel is attached by
    /// hand.
    pub fn detached(terminal: Box<dyn TerminalMode>) -> Self {
        let interactive = terminal.is_terminal();
        Self {
            peer_connection: None,
            data_channel: Mutex::new(None),
            offer: Mutex::new(None),
            answer: Mutex::new(None),
            termination: Termination::new(),
            interactive,
            terminal,
            raw_enabled: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn peer_connection(&self) -> Result<&Arc<RTCPeerConnection>, SessionError> {
        self.peer_connection
            .as_ref()
            .ok_or_else(|| SessionError::Transport("session has no peer connection".into()))
    }

    pub fn attach_data_channel(&self, channel: Arc<dyn DataChannel>) {
        debug!(target = "webtty::session", label = %channel.label(), "data channel attached");
        *self.data_channel.lock() = Some(channel);
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel.lock().clone()
    }

    pub fn set_offer(&self, offer: ConnectionDescription) {
        *self.offer.lock() = Some(offer);
    }

    pub fn offer(&self) -> Option<ConnectionDescription> {
        self.offer.lock().clone()
    }

    pub fn set_answer(&self, answer: ConnectionDescription) {
        *self.answer.lock() = Some(answer);
    }

    pub fn answer(&self) -> Option<ConnectionDescription> {
        self.answer.lock().clone()
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    /// Reports a terminal condition; `false` means another activity already
    /// ended the session and the caller should stop.
    pub fn settle(&self, outcome: Outcome) -> bool {
        self.termination.settle(outcome)
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_settled()
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn terminal(&self) -> &dyn TerminalMode {
        self.terminal.as_ref()
    }

    pub fn enable_raw_mode(&self) -> Result<(), SessionError> {
        if self.raw_enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.terminal.enable_raw() {
            self.raw_enabled.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        debug!(target = "webtty::session", "raw mode enabled");
        Ok(())
    }

    /// Puts the terminal back the way it was. Only the first call after
    /// [`Session::enable_raw_mode`] touches the terminal.
    pub fn restore_terminal(&self) -> Result<(), SessionError> {
        if !self.raw_enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.terminal.disable_raw()?;
        debug!(target = "webtty::session", "terminal restored");
        Ok(())
    }

    /// Tells the peer we are leaving and restores the terminal. Runs at most
    /// once per session.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = self.data_channel() {
            if let Err(err) = channel.send_text(QUIT.to_string()).await {
                debug!(target = "webtty::session", error = %err, "quit frame not delivered");
            }
        }
        if self.interactive {
            if let Err(err) = self.restore_terminal() {
                warn!(target = "webtty::session", error = %err, "failed to restore terminal");
            }
        }
    }

    /// The single consumer of the termination slot: waits for the outcome,
    /// cleans up and closes the peer connection.
    pub async fn wait_and_cleanup(&self) -> Outcome {
        let outcome = self.termination.wait().await;
        self.cleanup().await;
        if let Some(pc) = &self.peer_connection {
            tokio::time::sleep(QUIT_FLUSH_GRACE).await;
            if let Err(err) = pc.close().await {
                debug!(target = "webtty::session", error = %err, "peer connection close failed");
            }
        }
        outcome
    }
}
