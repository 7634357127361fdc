use crate::protocol::WindowSize;
use bytes::Bytes;
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use std::io::{self, IsTerminal, Read};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const PUMP_QUEUE_DEPTH: usize = 64;

/// The local terminal as seen by a session.
pub trait TerminalMode: Send + Sync {
    fn is_terminal(&self) -> bool;
    fn enable_raw(&self) -> io::Result<()>;
    fn disable_raw(&self) -> io::Result<()>;
    fn size(&self) -> Option<WindowSize>;
}

pub struct LocalTerminal;

impl TerminalMode for LocalTerminal {
    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn enable_raw(&self) -> io::Result<()> {
        enable_raw_mode()
    }

    fn disable_raw(&self) -> io::Result<()> {
        disable_raw_mode()
    }

    fn size(&self) -> Option<WindowSize> {
        if let Ok(window) = terminal::window_size() {
            if window.rows > 0 && window.columns > 0 {
                return Some(WindowSize {
                    rows: window.rows,
                    cols: window.columns,
                    pixel_width: window.width,
                    pixel_height: window.height,
                });
            }
        }
        match terminal::size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => Some(WindowSize::new(rows, cols)),
            _ => None,
        }
    }
}

/// Size for a freshly spawned pty: the local terminal if there is one, then
/// `$LINES`/`$COLUMNS`, then 24x80.
pub fn initial_pty_size(terminal: &dyn TerminalMode) -> WindowSize {
    if let Some(size) = terminal.size() {
        return size;
    }
    let cols = std::env::var("COLUMNS")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|cols| *cols > 0)
        .unwrap_or(80);
    let rows = std::env::var("LINES")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|rows| *rows > 0)
        .unwrap_or(24);
    WindowSize::new(rows, cols)
}

/// Moves a blocking reader onto its own thread and forwards what it reads in
/// chunks of at most `chunk` bytes. The channel closes on EOF; a read error
/// is delivered once and ends the pump.
pub fn pump_reader(
    name: &str,
    mut reader: Box<dyn Read + Send>,
    chunk: usize,
) -> io::Result<mpsc::Receiver<io::Result<Bytes>>> {
    let (tx, rx) = mpsc::channel(PUMP_QUEUE_DEPTH);
    let label = name.to_string();
    thread::Builder::new().name(label.clone()).spawn(move || {
        let mut buf = vec![0u8; chunk];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(target = "webtty::session::io", pump = %label, "reader reached eof");
                    break;
                }
                Ok(n) => {
                    trace!(target = "webtty::session::io", pump = %label, bytes = n, "read chunk");
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    break;
                }
            }
        }
    })?;
    Ok(rx)
}
