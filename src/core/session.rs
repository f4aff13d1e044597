//! Shell session - one logical shell over one transport
//!
//! Owns the prompt matcher, the escape filter and the connection state.
//! Remote transports are checked before use: a transport that reports
//! itself dead, or that fails to echo a random acknowledgment token, is
//! re-opened and reattached to the same shell, up to a fixed budget.

use super::escape::EscapeFilter;
use super::prompt::{PromptMatch, PromptMatcher};
use super::transport::{transport_for, Transport};
use crate::config::{Config, ProbeConfig, ReconnectConfig, TransportKind};
use crate::error::{Result, ShellError};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::path::Path;
use std::time::Duration;

const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const ACK_TOKEN_LEN: usize = 30;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Reconnecting,
    /// Reconnect budget exhausted
    Aborted,
}

pub struct ShellSession {
    transport: Box<dyn Transport>,
    matcher: PromptMatcher,
    filter: EscapeFilter,
    state: SessionState,
    terminal_type: String,
    handshake_polls: u32,
    reconnect: ReconnectConfig,
    probe: ProbeConfig,
    /// Reconnect attempts since the shell last proved it was alive
    failed_attempts: u32,
}

impl ShellSession {
    /// Session over the transport described by `config`, not yet connected
    pub fn new(config: &Config) -> Result<Self> {
        let transport = transport_for(config)?;
        Self::with_transport(transport, config)
    }

    /// Session over a caller-supplied transport
    pub fn with_transport(transport: Box<dyn Transport>, config: &Config) -> Result<Self> {
        Ok(Self {
            transport,
            matcher: PromptMatcher::configure(&config.prompt)?,
            filter: EscapeFilter::new(),
            state: SessionState::Disconnected,
            terminal_type: config.terminal_type.clone(),
            handshake_polls: config.handshake_polls,
            reconnect: config.reconnect.clone(),
            probe: config.probe.clone(),
            failed_attempts: 0,
        })
    }

    /// Create and connect in one step
    pub fn connect_with(config: &Config) -> Result<Self> {
        let mut session = Self::new(config)?;
        session.connect()?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn prompt(&self) -> &str {
        self.matcher.template()
    }

    /// Open the transport and synchronise on a freshly installed prompt
    pub fn connect(&mut self) -> Result<()> {
        self.state = SessionState::Connecting;
        log::info!("Connecting {} session", self.transport.kind());
        self.transport.open()?;
        self.transport.start_shell()?;
        self.handshake()?;
        self.state = SessionState::Ready;
        log::info!("Session ready, prompt `{}`", self.matcher.template());
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        self.matcher = PromptMatcher::configure(self.matcher.template())?;
        let setup = format!(
            "TERM=\"{}\"\nunset PROMPT_COMMAND\nPS1=\"{}\"\n",
            self.terminal_type,
            self.matcher.template()
        );
        self.send_raw(&setup)?;

        let mut pending = String::new();
        for _ in 0..self.handshake_polls {
            let Some(text) = self.receive(1000)? else {
                std::thread::sleep(HANDSHAKE_POLL_INTERVAL);
                continue;
            };
            pending.push_str(&text);
            let (complete, partial) = split_lines(&pending);
            let mut found = false;
            for line in complete.iter().chain(std::iter::once(&partial)) {
                if self.match_prompt(line)? {
                    found = true;
                }
            }
            if found {
                self.settle()?;
                return Ok(());
            }
            pending = partial;
        }

        Err(ShellError::HandshakeTimeout {
            prompt: self.matcher.template().to_string(),
        })
    }

    /// Consume prompts still in flight so the counter is current
    fn settle(&mut self) -> Result<()> {
        let mut pending = String::new();
        while let Some(text) = self.receive(1000)? {
            pending.push_str(&text);
        }
        let (complete, partial) = split_lines(&pending);
        for line in complete.iter().chain(std::iter::once(&partial)) {
            self.matcher.test(line);
        }
        Ok(())
    }

    /// Test a line for a fresh prompt, nudging the shell on misaligned ones
    pub fn match_prompt(&mut self, line: &str) -> Result<bool> {
        match self.matcher.test(line) {
            PromptMatch::Complete => Ok(true),
            PromptMatch::Misaligned => {
                log::debug!("Prompt after garbage in {:?}, sending newline", line);
                self.send_raw("\n")?;
                Ok(false)
            }
            PromptMatch::None => Ok(false),
        }
    }

    /// Send text after making sure the connection is alive
    pub fn send(&mut self, text: &str) -> Result<()> {
        self.ensure_connected()?;
        if self.transport.probes_before_send() {
            self.probe()?;
        }
        self.send_raw(text)
    }

    /// Send text with no liveness checks
    pub fn send_raw(&mut self, text: &str) -> Result<()> {
        match self.transport.send_raw(text.as_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if self.transport.reconnectable() => {
                log::warn!("Send failed ({}), reconnecting", e);
                self.reconnect()?;
                self.transport.send_raw(text.as_bytes())
            }
            Err(e) => Err(e),
        }
    }

    /// Send Ctrl-C to the foreground process
    pub fn interrupt(&mut self) -> Result<()> {
        self.send_raw("\x03")
    }

    /// Poll for output; `Ok(None)` when nothing arrived within the timeout
    pub fn receive(&mut self, max: usize) -> Result<Option<String>> {
        self.ensure_connected()?;
        let text = match self.read_transport(max) {
            Ok(text) => text,
            Err(e) if self.transport.reconnectable() => {
                log::warn!("Receive failed ({}), reconnecting", e);
                self.reconnect()?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match text {
            Some(text) => {
                self.failed_attempts = 0;
                Ok(Some(text))
            }
            None if !self.transport.reconnectable() && !self.transport.is_active() => {
                Err(ShellError::Transport(format!(
                    "{} shell has exited",
                    self.transport.kind()
                )))
            }
            None => Ok(None),
        }
    }

    /// One poll of the transport, filtered when the transport needs it
    fn read_transport(&mut self, max: usize) -> Result<Option<String>> {
        Ok(match self.transport.receive_raw(max)? {
            Some(bytes) if self.transport.filters_output() => Some(self.filter.filter(&bytes)),
            Some(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            None => None,
        })
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.state == SessionState::Aborted {
            return Err(ShellError::ConnectionExhausted {
                attempts: self.reconnect.attempts,
            });
        }
        if self.transport.reconnectable() && !self.transport.is_active() {
            log::warn!("{} transport is no longer active", self.transport.kind());
            self.reconnect()?;
        }
        Ok(())
    }

    /// Echo a single-use token through the shell; reconnect if it never returns.
    pub fn probe(&mut self) -> Result<()> {
        match self.acknowledge() {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::warn!("No acknowledgment from the shell, reconnecting");
                self.reconnect()
            }
            Err(e) if self.transport.reconnectable() => {
                log::warn!("Probe failed ({}), reconnecting", e);
                self.reconnect()
            }
            Err(e) => Err(e),
        }
    }

    /// Round-trip an `#ack` comment straight through the transport.
    ///
    /// A comment leaves the previous return code intact. `Ok(true)` only
    /// when the token came back, which also clears the reconnect count.
    fn acknowledge(&mut self) -> Result<bool> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(ACK_TOKEN_LEN)
            .map(|c| char::from(c).to_ascii_uppercase())
            .collect();
        let message = format!("#ack {}", token);
        self.transport.send_raw(format!("{}\n", message).as_bytes())?;

        let mut rx = String::new();
        for _ in 0..=self.probe.attempts {
            if let Some(text) = self.read_transport(1000)? {
                rx.push_str(&text);
            }
            if rx.contains(&message) {
                self.failed_attempts = 0;
                self.absorb_probe_prompt(rx, &message)?;
                return Ok(true);
            }
            if !self.transport.is_active() {
                return Ok(false);
            }
            std::thread::sleep(self.probe.interval());
        }
        Ok(false)
    }

    /// The acknowledged comment produces a prompt of its own; consume it
    /// so it cannot be taken for the end of the next command.
    fn absorb_probe_prompt(&mut self, mut rx: String, message: &str) -> Result<()> {
        for _ in 0..=self.probe.attempts {
            let after = rx.rsplit(message).next().unwrap_or("");
            let (lines, partial) = split_lines(after);
            let matcher = &mut self.matcher;
            if lines
                .iter()
                .chain(std::iter::once(&partial))
                .any(|line| matcher.test(line) == PromptMatch::Complete)
            {
                return Ok(());
            }
            std::thread::sleep(self.probe.interval());
            if let Some(text) = self.read_transport(1000)? {
                rx.push_str(&text);
            }
        }
        log::debug!("Probe prompt not seen");
        Ok(())
    }

    /// Re-open the transport and rejoin the shell, within the retry budget.
    ///
    /// An attempt only succeeds once the shell acknowledges a token; the
    /// budget is shared by every reconnect until that happens.
    pub fn reconnect(&mut self) -> Result<()> {
        self.state = SessionState::Reconnecting;
        let attempts = self.reconnect.attempts;
        while self.failed_attempts < attempts {
            self.failed_attempts += 1;
            let attempt = self.failed_attempts;
            match self.try_reattach() {
                Ok(true) => {
                    log::info!("Reconnected after {} attempt(s)", attempt);
                    self.state = SessionState::Ready;
                    return Ok(());
                }
                Ok(false) => log::warn!(
                    "Reconnect attempt {}/{} got no acknowledgment. Trying again in {:?}",
                    attempt,
                    attempts,
                    self.reconnect.delay()
                ),
                Err(e) => log::warn!(
                    "Unable to reconnect (attempt {}/{}): {}. Trying again in {:?}",
                    attempt,
                    attempts,
                    e,
                    self.reconnect.delay()
                ),
            }
            std::thread::sleep(self.reconnect.delay());
        }

        log::error!("Unable to reconnect. Giving up and aborting job.");
        self.state = SessionState::Aborted;
        Err(ShellError::ConnectionExhausted { attempts })
    }

    fn try_reattach(&mut self) -> Result<bool> {
        self.transport.open()?;
        self.transport.reattach()?;
        if !self.transport.is_active() {
            return Ok(false);
        }
        self.acknowledge()
    }

    pub fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        self.transport.put_file(local, remote)
    }

    pub fn get_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.transport.get_file(remote, local)
    }

    /// Leave the shell and release the transport
    pub fn close(&mut self) {
        if self.state != SessionState::Disconnected {
            log::info!("Closing {} session", self.transport.kind());
            self.transport.close();
            self.state = SessionState::Disconnected;
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split text into terminated lines and the unterminated remainder.
///
/// `\n`, `\r\n` and `\r` all end a line, except a trailing `\r` which may
/// be the first half of a `\r\n` still in flight.
pub fn split_lines(text: &str) -> (Vec<String>, String) {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => lines.push(std::mem::take(&mut current)),
            '\r' => match chars.peek() {
                Some('\n') => {
                    chars.next();
                    lines.push(std::mem::take(&mut current));
                }
                Some(_) => lines.push(std::mem::take(&mut current)),
                None => current.push(c),
            },
            _ => current.push(c),
        }
    }
    (lines, current)
}
