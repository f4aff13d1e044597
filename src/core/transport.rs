//! Transports - the byte pipes a shell session runs over
//!
//! Three variants share one trait:
//! - [`LocalTransport`]: a login shell in a local PTY
//! - [`MultiplexedRemoteTransport`]: ssh into the target, with the shell
//!   inside a named GNU screen session that survives network drops
//! - [`BareRemoteTransport`]: a line-oriented TCP console (telnet style)
//!
//! Everything above `open/send_raw/receive_raw` (handshake, filtering,
//! liveness, reconnect) lives in [`crate::core::ShellSession`].

use super::pty::PtyChannel;
use crate::config::{Config, Reservation, TransportKind};
use crate::error::{Result, ShellError};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Receive timeout for a single non-blocking poll
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONSOLE_PORT: u16 = 23;

/// Transport-specific half of a shell session
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Establish a new connection, dropping any previous one
    fn open(&mut self) -> Result<()>;

    /// Bring up the shell after the first `open`
    fn start_shell(&mut self) -> Result<()> {
        Ok(())
    }

    /// Rejoin the existing shell after a reconnecting `open`
    fn reattach(&mut self) -> Result<()> {
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Poll for up to `max` bytes; `Ok(None)` when nothing is available
    fn receive_raw(&mut self, max: usize) -> Result<Option<Vec<u8>>>;

    /// Whether the transport itself reports the connection as up
    fn is_active(&mut self) -> bool;

    /// Output carries terminal escapes that must be filtered
    fn filters_output(&self) -> bool {
        true
    }

    /// A dropped connection can be re-opened without losing the shell
    fn reconnectable(&self) -> bool {
        false
    }

    /// Round-trip a token before each send to catch zombie connections
    fn probes_before_send(&self) -> bool {
        false
    }

    fn put_file(&mut self, _local: &Path, _remote: &str) -> Result<()> {
        Err(ShellError::Unsupported {
            operation: "put_file",
            transport: self.kind(),
        })
    }

    fn get_file(&mut self, _remote: &str, _local: &Path) -> Result<()> {
        Err(ShellError::Unsupported {
            operation: "get_file",
            transport: self.kind(),
        })
    }

    /// Leave the shell and release the connection
    fn close(&mut self);
}

/// Build the transport described by `config`
pub fn transport_for(config: &Config) -> Result<Box<dyn Transport>> {
    let kind = config.target.resolved_kind();
    match kind {
        TransportKind::Local | TransportKind::Auto => Ok(Box::new(LocalTransport::new(config))),
        TransportKind::MultiplexedRemote => {
            let reserved = config
                .target
                .reserved
                .clone()
                .ok_or(ShellError::UnimplementedTransport(kind))?;
            Ok(Box::new(MultiplexedRemoteTransport::new(config, reserved)))
        }
        TransportKind::BareRemote => {
            let reserved = config
                .target
                .reserved
                .clone()
                .ok_or(ShellError::UnimplementedTransport(kind))?;
            Ok(Box::new(BareRemoteTransport::new(reserved)))
        }
    }
}

fn pty_read(pty: &mut Option<PtyChannel>, max: usize) -> Result<Option<Vec<u8>>> {
    match pty {
        Some(pty) => pty.read_timeout(max, RECEIVE_TIMEOUT),
        None => Ok(None),
    }
}

fn pty_write(pty: &mut Option<PtyChannel>, data: &[u8]) -> Result<()> {
    match pty {
        Some(pty) => pty.write(data),
        None => Err(ShellError::Transport("not connected".to_string())),
    }
}

/// Commands run on the local machine, exactly as they would over ssh
pub struct LocalTransport {
    shell: Vec<String>,
    terminal_type: String,
    pty: Option<PtyChannel>,
}

impl LocalTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            shell: config.local_shell.clone(),
            terminal_type: config.terminal_type.clone(),
            pty: None,
        }
    }
}

impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn open(&mut self) -> Result<()> {
        self.pty = Some(PtyChannel::spawn(&self.shell, &self.terminal_type)?);
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        pty_write(&mut self.pty, data)
    }

    fn receive_raw(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        pty_read(&mut self.pty, max)
    }

    fn is_active(&mut self) -> bool {
        self.pty.as_mut().map_or(false, |pty| pty.is_alive())
    }

    fn filters_output(&self) -> bool {
        false
    }

    fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        std::fs::copy(local, remote)?;
        Ok(())
    }

    fn get_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        std::fs::copy(remote, local)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut pty) = self.pty.take() {
            let _ = pty.write(b"exit\n");
            std::thread::sleep(RECEIVE_TIMEOUT);
            pty.kill();
        }
    }
}

/// ssh to the reserved machine and run the shell inside GNU screen
pub struct MultiplexedRemoteTransport {
    reserved: Reservation,
    ssh_program: String,
    ssh_options: Vec<String>,
    session_name: String,
    terminal_type: String,
    pty: Option<PtyChannel>,
}

impl MultiplexedRemoteTransport {
    pub fn new(config: &Config, reserved: Reservation) -> Self {
        Self {
            reserved,
            ssh_program: config.ssh_program.clone(),
            ssh_options: config.ssh_options.clone(),
            session_name: config.session_name.clone(),
            terminal_type: config.terminal_type.clone(),
            pty: None,
        }
    }

    fn ssh_argv(&self) -> Vec<String> {
        let mut argv = vec![self.ssh_program.clone()];
        argv.extend(self.ssh_options.iter().cloned());
        argv.push("-tt".to_string());
        if let Some(port) = self.reserved.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        argv.push(self.reserved.destination());
        argv
    }

    fn scp(&self, from: &str, to: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(&self.ssh_options);
        if let Some(port) = self.reserved.port {
            cmd.arg("-P").arg(port.to_string());
        }
        let status = cmd.arg(from).arg(to).status()?;
        if !status.success() {
            return Err(ShellError::Transport(format!(
                "scp {} {} exited with {}",
                from, to, status
            )));
        }
        Ok(())
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.reserved.destination(), path)
    }
}

impl Transport for MultiplexedRemoteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::MultiplexedRemote
    }

    fn open(&mut self) -> Result<()> {
        if let Some(mut old) = self.pty.take() {
            old.kill();
        }
        log::info!("Connecting to {}", self.reserved.destination());
        self.pty = Some(PtyChannel::spawn(&self.ssh_argv(), &self.terminal_type)?);
        Ok(())
    }

    fn start_shell(&mut self) -> Result<()> {
        let setup = format!(
            "TERM=\"{}\"\nscreen -qL -S {} bash\n",
            self.terminal_type, self.session_name
        );
        self.send_raw(setup.as_bytes())
    }

    fn reattach(&mut self) -> Result<()> {
        log::info!("Reattaching to screen session {}", self.session_name);
        let cmd = format!("screen -d -r {}\n", self.session_name);
        self.send_raw(cmd.as_bytes())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        pty_write(&mut self.pty, data)
    }

    fn receive_raw(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        pty_read(&mut self.pty, max)
    }

    fn is_active(&mut self) -> bool {
        self.pty.as_mut().map_or(false, |pty| pty.is_alive())
    }

    fn reconnectable(&self) -> bool {
        true
    }

    fn probes_before_send(&self) -> bool {
        true
    }

    fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        self.scp(&local.to_string_lossy(), &self.remote_spec(remote))
    }

    fn get_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.scp(&self.remote_spec(remote), &local.to_string_lossy())
    }

    fn close(&mut self) {
        if let Some(mut pty) = self.pty.take() {
            let _ = pty.write(b"exit\n");
            std::thread::sleep(RECEIVE_TIMEOUT);
            pty.kill();
        }
    }
}

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// A serial-console style TCP line, e.g. a board behind a console server
pub struct BareRemoteTransport {
    reserved: Reservation,
    stream: Option<TcpStream>,
    closed: bool,
}

impl BareRemoteTransport {
    pub fn new(reserved: Reservation) -> Self {
        Self {
            reserved,
            stream: None,
            closed: true,
        }
    }

    /// Strip telnet option negotiation, refusing every option offered
    fn negotiate(raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(raw.len());
        let mut replies = Vec::new();
        let mut i = 0;
        while i < raw.len() {
            if raw[i] != IAC {
                data.push(raw[i]);
                i += 1;
                continue;
            }
            match raw.get(i + 1).copied() {
                Some(IAC) => {
                    data.push(IAC);
                    i += 2;
                }
                Some(cmd @ (DO | DONT | WILL | WONT)) => {
                    if let Some(&option) = raw.get(i + 2) {
                        match cmd {
                            DO => replies.extend_from_slice(&[IAC, WONT, option]),
                            WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                            _ => {}
                        }
                    }
                    i += 3;
                }
                Some(SB) => {
                    i += 2;
                    while i < raw.len() && !(raw[i] == IAC && raw.get(i + 1) == Some(&SE)) {
                        i += 1;
                    }
                    i += 2;
                }
                _ => i += 2,
            }
        }
        (data, replies)
    }
}

impl Transport for BareRemoteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::BareRemote
    }

    fn open(&mut self) -> Result<()> {
        let port = self.reserved.port.unwrap_or(DEFAULT_CONSOLE_PORT);
        log::info!("Connecting to console {}:{}", self.reserved.hostname, port);
        let addr = (self.reserved.hostname.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ShellError::Transport(format!("cannot resolve {}", self.reserved.hostname))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.closed = false;
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ShellError::Transport("not connected".to_string()))?;
        stream.write_all(data)?;
        Ok(())
    }

    fn receive_raw(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; max.max(1)];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.closed = true;
                Ok(None)
            }
            Ok(n) => {
                let (data, replies) = Self::negotiate(&buf[..n]);
                if !replies.is_empty() {
                    stream.write_all(&replies)?;
                }
                Ok(if data.is_empty() { None } else { Some(data) })
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_active(&mut self) -> bool {
        self.stream.is_some() && !self.closed
    }

    fn reconnectable(&self) -> bool {
        true
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.write_all(b"exit\n");
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.closed = true;
    }
}
