//! PTY (pseudo-terminal) management - spawn a process and talk to it
//!
//! Reads happen on a dedicated thread that forwards chunks over a channel,
//! so the session side can poll with a short timeout instead of blocking.

use crate::error::{Result, ShellError};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

/// A child process attached to a pseudo-terminal
pub struct PtyChannel {
    label: String,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    output: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    // Dropping the master closes the terminal; keep it for the child's lifetime
    _master: Box<dyn MasterPty + Send>,
}

impl PtyChannel {
    /// Spawn `argv` in a fresh 80x24 PTY
    pub fn spawn(argv: &[String], terminal_type: &str) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ShellError::Config("empty command line".to_string()))?;
        log::info!("Spawning PTY: {}", argv.join(" "));

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.env("TERM", terminal_type);

        let pty_system = native_pty_system();
        let pty_size = PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(pty_size).map_err(ShellError::transport)?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(ShellError::transport)?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(ShellError::transport)?;
        let writer = pair.master.take_writer().map_err(ShellError::transport)?;

        let (tx, rx) = mpsc::channel();
        let label = program.clone();
        let thread_label = label.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("PTY reader for {} stopped: {}", thread_label, e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            label,
            child,
            writer,
            output: rx,
            pending: Vec::new(),
            _master: pair.master,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read up to `max` bytes, waiting at most `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time (or the process is gone).
    pub fn read_timeout(&mut self, max: usize, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.pending.is_empty() {
            match self.output.recv_timeout(timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(None)
                }
            }
        }
        // Coalesce whatever else is already queued
        while self.pending.len() < max {
            match self.output.try_recv() {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }

        let take = self.pending.len().min(max.max(1));
        let rest = self.pending.split_off(take);
        Ok(Some(std::mem::replace(&mut self.pending, rest)))
    }

    /// Whether the child process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn kill(&mut self) {
        if self.is_alive() {
            if let Err(e) = self.child.kill() {
                log::warn!("Failed to kill {}: {}", self.label, e);
            }
        }
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_echo_and_read() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "echo pty-ok".to_string()];
        let Ok(mut pty) = PtyChannel::spawn(&argv, "vt100") else {
            return;
        };

        let mut seen = Vec::new();
        for _ in 0..50 {
            if let Some(chunk) = pty.read_timeout(1024, Duration::from_millis(100)).unwrap() {
                seen.extend(chunk);
            }
            if String::from_utf8_lossy(&seen).contains("pty-ok") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("pty-ok"));
    }

    #[test]
    fn test_read_respects_max() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "echo 0123456789".to_string()];
        let Ok(mut pty) = PtyChannel::spawn(&argv, "vt100") else {
            return;
        };
        for _ in 0..50 {
            if let Some(chunk) = pty.read_timeout(4, Duration::from_millis(100)).unwrap() {
                assert!(chunk.len() <= 4);
                return;
            }
        }
    }
}
