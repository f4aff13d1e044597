//! Operator password prompt for privileged commands

use crate::error::{Result, ShellError};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::{Arc, Mutex};

/// Environment variable that supplies the sudo password without prompting
pub const SUDO_PASSWORD_ENV: &str = "SHELLPILOT_SUDO_PASSWORD";

/// Where sudo passwords come from when the target asks for one
pub trait PasswordSource: Send {
    fn request_password(&mut self, prompt: &str) -> Result<String>;
}

/// Ask the operator on the controlling terminal, without echo
#[derive(Debug, Default)]
pub struct TerminalPrompt;

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

impl PasswordSource for TerminalPrompt {
    fn request_password(&mut self, prompt: &str) -> Result<String> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{}", prompt)?;
        stderr.flush()?;

        if !std::io::stdin().is_terminal() {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            return Ok(line.trim_end_matches(['\r', '\n']).to_string());
        }

        let mut password = String::new();
        {
            let _guard = RawModeGuard::enable()?;
            loop {
                let Event::Key(key) = event::read()? else {
                    continue;
                };
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Enter => break,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        return Err(ShellError::Config("password entry cancelled".to_string()));
                    }
                    KeyCode::Char(c) => password.push(c),
                    KeyCode::Backspace => {
                        password.pop();
                    }
                    _ => {}
                }
            }
        }
        writeln!(stderr)?;
        Ok(password)
    }
}

/// A password known up front, e.g. from the environment
#[derive(Debug, Clone)]
pub struct FixedPassword(pub String);

impl PasswordSource for FixedPassword {
    fn request_password(&mut self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// [`FixedPassword`] from [`SUDO_PASSWORD_ENV`] when set, the terminal otherwise
pub fn password_source_from_env() -> Box<dyn PasswordSource> {
    match std::env::var(SUDO_PASSWORD_ENV) {
        Ok(password) => Box::new(FixedPassword(password)),
        Err(_) => Box::new(TerminalPrompt),
    }
}

struct SharedState {
    source: Box<dyn PasswordSource>,
    answer: Option<String>,
}

/// One password source behind several executors.
///
/// The first request asks the wrapped source; every later request, from
/// any clone, gets the same answer. Requests are serialised, so concurrent
/// targets never prompt on the terminal at the same time.
#[derive(Clone)]
pub struct SharedPassword {
    inner: Arc<Mutex<SharedState>>,
}

impl SharedPassword {
    pub fn new(source: Box<dyn PasswordSource>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedState {
                source,
                answer: None,
            })),
        }
    }

    pub fn from_env() -> Self {
        Self::new(password_source_from_env())
    }
}

impl PasswordSource for SharedPassword {
    fn request_password(&mut self, prompt: &str) -> Result<String> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| ShellError::Config("password source poisoned".to_string()))?;
        if let Some(answer) = &state.answer {
            return Ok(answer.clone());
        }
        let answer = state.source.request_password(prompt)?;
        state.answer = Some(answer.clone());
        Ok(answer)
    }
}
