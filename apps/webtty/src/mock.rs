//! In-process stand-ins for the data channel, the local terminal and the pty.
//! Used by the unit tests and the integration suite.

use crate::host::pty::PtyControl;
use crate::protocol::{Frame, WindowSize};
use crate::session::{SessionError, TerminalMode};
use crate::transport::DataChannel;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Data channel that keeps every frame sent through it.
#[derive(Default)]
pub struct RecordingChannel {
    frames: Mutex<Vec<Frame>>,
    closed: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later send fail, as a torn-down channel would.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text.clone()),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    fn record(&self, frame: Frame) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("data channel closed".into()));
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

#[async_trait]
impl DataChannel for RecordingChannel {
    fn label(&self) -> String {
        "recording".into()
    }

    async fn send_binary(&self, bytes: Bytes) -> Result<(), SessionError> {
        self.record(Frame::Binary(bytes))
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.record(Frame::Text(text))
    }
}

#[derive(Default)]
struct TerminalCounters {
    raw_enabled: AtomicUsize,
    restored: AtomicUsize,
}

/// Terminal whose raw-mode toggles are counted instead of applied.
#[derive(Clone)]
pub struct ScriptedTerminal {
    is_tty: bool,
    size: Option<WindowSize>,
    counters: Arc<TerminalCounters>,
}

impl ScriptedTerminal {
    pub fn interactive() -> Self {
        Self {
            is_tty: true,
            size: Some(WindowSize::default()),
            counters: Arc::default(),
        }
    }

    pub fn detached() -> Self {
        Self {
            is_tty: false,
            size: None,
            counters: Arc::default(),
        }
    }

    pub fn with_size(mut self, size: WindowSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn raw_enabled_count(&self) -> usize {
        self.counters.raw_enabled.load(Ordering::SeqCst)
    }

    pub fn restore_count(&self) -> usize {
        self.counters.restored.load(Ordering::SeqCst)
    }
}

impl TerminalMode for ScriptedTerminal {
    fn is_terminal(&self) -> bool {
        self.is_tty
    }

    fn enable_raw(&self) -> io::Result<()> {
        self.counters.raw_enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable_raw(&self) -> io::Result<()> {
        self.counters.restored.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> Option<WindowSize> {
        self.size
    }
}

#[derive(Default)]
struct PtyRecord {
    written: Vec<u8>,
    writes: usize,
    sizes: Vec<WindowSize>,
}

/// Pty that records input and resizes. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingPty {
    record: Arc<Mutex<PtyRecord>>,
}

impl RecordingPty {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<u8> {
        self.record.lock().written.clone()
    }

    pub fn write_count(&self) -> usize {
        self.record.lock().writes
    }

    pub fn sizes(&self) -> Vec<WindowSize> {
        self.record.lock().sizes.clone()
    }

    pub fn last_size(&self) -> Option<WindowSize> {
        self.record.lock().sizes.last().copied()
    }
}

impl PtyControl for RecordingPty {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut record = self.record.lock();
        record.written.extend_from_slice(bytes);
        record.writes += 1;
        Ok(())
    }

    fn resize(&mut self, size: WindowSize) -> io::Result<()> {
        self.record.lock().sizes.push(size);
        Ok(())
    }
}
