use crate::protocol::WindowSize;
use anyhow::{Context, Result, anyhow};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use tracing::debug;

/// Input side and geometry of the host's pseudo-terminal.
pub trait PtyControl: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn resize(&mut self, size: WindowSize) -> io::Result<()>;
}

/// A command running under a pty. Dropping it kills the command.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyProcess {
    /// Spawns `command` attached to a new pty and returns the process plus
    /// the reader for everything it prints.
    pub fn spawn(command: &[String], size: WindowSize) -> Result<(Self, Box<dyn Read + Send>)> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("no command to run"))?;

        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        if std::env::var_os("TERM").is_none() {
            builder.env("TERM", "xterm-256color");
        }
        if let Ok(cwd) = std::env::current_dir() {
            builder.cwd(cwd);
        }

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .context("failed to open pty")?;
        let child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("failed to spawn {program}"))?;
        // Only the child may hold the slave, otherwise the reader never sees
        // EOF when the command exits.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;
        debug!(
            target = "webtty::host::pty",
            program = %program,
            rows = size.rows,
            cols = size.cols,
            "spawned command under pty"
        );

        Ok((
            Self {
                master: pair.master,
                writer,
                child,
            },
            reader,
        ))
    }
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: size.pixel_width,
        pixel_height: size.pixel_height,
    }
}

impl PtyControl for PtyProcess {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn resize(&mut self, size: WindowSize) -> io::Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|err| io::Error::other(err.to_string()))
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
