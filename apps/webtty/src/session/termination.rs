use super::SessionError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

pub type Outcome = Result<(), SessionError>;

/// Settle-once termination slot.
///
/// Every activity of a session reports its terminal condition here. The
/// first report wins; later ones are discarded and tell the caller to stop
/// producing. Exactly one consumer receives the winning outcome.
pub struct Termination {
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
    receiver: Mutex<Option<oneshot::Receiver<Outcome>>>,
    settled: AtomicBool,
}

impl Termination {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            settled: AtomicBool::new(false),
        }
    }

    /// Returns `true` if this call decided the outcome.
    pub fn settle(&self, outcome: Outcome) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            trace!(
                target = "webtty::session",
                outcome = ?outcome,
                "termination already settled; dropping outcome"
            );
            return false;
        };
        self.settled.store(true, Ordering::SeqCst);
        debug!(target = "webtty::session", outcome = ?outcome, "termination settled");
        // The receiver lives in `self`, so the send only fails once the
        // consumer has given up waiting.
        let _ = sender.send(outcome);
        true
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Waits for the winning outcome. Only the first caller gets it.
    pub async fn wait(&self) -> Outcome {
        let receiver = self.receiver.lock().take();
        match receiver {
            Some(receiver) => receiver.await.unwrap_or_else(|_| {
                Err(SessionError::Transport("termination signal dropped".into()))
            }),
            None => Err(SessionError::Transport(
                "termination outcome already consumed".into(),
            )),
        }
    }
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot readiness flag that any number of tasks can await.
pub struct Readiness {
    tx: watch::Sender<bool>,
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by `self`, so the channel cannot close here.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
