//! Configuration - target descriptor, timing budgets and responder tables
//!
//! Loaded from YAML. Every field has a default so a config file only needs
//! to name what differs:
//! ```yaml
//! target:
//!   transport: multiplexed-remote
//!   reserved:
//!     hostname: build-07.example.org
//!     username: ci
//! prompt: 'ci_target \#: '
//! reconnect:
//!   attempts: 100
//!   delay_secs: 15
//! ```

use crate::error::{Result, ShellError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which transport carries the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Local for `localhost`, multiplexed remote otherwise
    Auto,
    Local,
    MultiplexedRemote,
    BareRemote,
}

impl Default for TransportKind {
    fn default() -> Self {
        Self::Auto
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Local => write!(f, "local"),
            Self::MultiplexedRemote => write!(f, "multiplexed-remote"),
            Self::BareRemote => write!(f, "bare-remote"),
        }
    }
}

/// A machine that has been reserved for the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub hostname: String,
    pub username: Option<String>,
    pub port: Option<u16>,
}

impl Reservation {
    /// `user@host`, or just `host` without a username
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.hostname),
            None => self.hostname.clone(),
        }
    }
}

/// Target descriptor supplied by the job layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub transport: TransportKind,
    pub reserved: Option<Reservation>,
}

impl TargetConfig {
    /// Resolve `Auto` against the reservation
    pub fn resolved_kind(&self) -> TransportKind {
        match self.transport {
            TransportKind::Auto => match &self.reserved {
                Some(r) if r.hostname == "localhost" => TransportKind::Local,
                _ => TransportKind::MultiplexedRemote,
            },
            kind => kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub attempts: u32,
    pub delay_secs: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 100,
            delay_secs: 15.0,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_secs.max(0.0))
    }
}

/// Round-tripped acknowledgment token used to spot zombie transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval_ms: 250,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Silence after which a bare newline is sent
    pub stall_nudge_secs: f64,
    /// Ceiling for the exponential poll backoff
    pub max_backoff_ms: u64,
    /// Bytes requested per receive
    pub chunk_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stall_nudge_secs: 200.0,
            max_backoff_ms: 2000,
            chunk_size: 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn stall_nudge(&self) -> Duration {
        Duration::from_secs_f64(self.stall_nudge_secs.max(0.0))
    }

    /// Backoff ceiling, never above the stall-nudge cadence
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms).min(self.stall_nudge())
    }
}

/// A prompt that always gets the same answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CannedAnswer {
    pub pattern: String,
    pub response: String,
}

/// A (possibly multi-line) prompt and the text sent when it appears
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectationConfig {
    pub lines: Vec<String>,
    pub response: String,
}

/// Pattern tables for hung tools and interactive prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    pub unresponsive: Vec<String>,
    pub canned: Vec<CannedAnswer>,
    pub sudo_prompt: String,
    pub expectations: Vec<ExpectationConfig>,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            unresponsive: vec![r"^fatal: The remote end hung up unexpectedly$".to_string()],
            canned: vec![CannedAnswer {
                pattern: r"^Enable color display in this user account \(y/N\)\?\s*$".to_string(),
                response: "N".to_string(),
            }],
            sudo_prompt: r"^\[sudo\] password for ".to_string(),
            expectations: vec![ExpectationConfig {
                lines: vec![
                    r"The authenticity of host 'bazaar.launchpad.net \(\S+\)' can't be established.".to_string(),
                    r"RSA key fingerprint is \S+".to_string(),
                    r"Are you sure you want to continue connecting \(yes/no\)\?".to_string(),
                ],
                response: "yes".to_string(),
            }],
        }
    }
}

/// Identity configured for git when none exists on the target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitIdentity {
    pub email: String,
    pub name: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            email: "infrastructure@example.org".to_string(),
            name: "Infrastructure Robot".to_string(),
        }
    }
}

/// Complete configuration for one target session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub prompt: String,
    pub terminal_type: String,
    pub session_name: String,
    pub local_shell: Vec<String>,
    pub ssh_program: String,
    pub ssh_options: Vec<String>,
    pub handshake_polls: u32,
    pub reconnect: ReconnectConfig,
    pub probe: ProbeConfig,
    pub executor: ExecutorConfig,
    pub interaction: InteractionConfig,
    pub git_identity: GitIdentity,
    pub repo_tool: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            prompt: r"shellpilot \#: ".to_string(),
            terminal_type: "vt100".to_string(),
            session_name: "ci-runtime".to_string(),
            local_shell: vec![
                "/bin/bash".to_string(),
                "--noediting".to_string(),
                "-li".to_string(),
            ],
            ssh_program: "ssh".to_string(),
            ssh_options: vec!["-o".to_string(), "StrictHostKeyChecking=accept-new".to_string()],
            handshake_polls: 3000,
            reconnect: ReconnectConfig::default(),
            probe: ProbeConfig::default(),
            executor: ExecutorConfig::default(),
            interaction: InteractionConfig::default(),
            git_identity: GitIdentity::default(),
            repo_tool: "~/bin/repo".to_string(),
        }
    }
}

impl Config {
    /// Default config location: ~/.shellpilot/config.yml
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shellpilot")
            .join("config.yml")
    }

    /// Load config from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| ShellError::Config(e.to_string()))
    }

    /// Load from the default location, falling back to defaults
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Config for a local shell, as used by tests and `--local`
    pub fn local() -> Self {
        let mut config = Self::default();
        config.target = TargetConfig {
            transport: TransportKind::Local,
            reserved: Some(Reservation {
                hostname: "localhost".to_string(),
                username: None,
                port: None,
            }),
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.reconnect.attempts, 100);
        assert_eq!(config.probe.attempts, 10);
        assert_eq!(config.session_name, "ci-runtime");
        assert_eq!(config.target.transport, TransportKind::Auto);
        assert!(config.target.reserved.is_none());
    }

    #[test]
    fn test_parse_remote_target() {
        let yaml = r#"
target:
  transport: bare-remote
  reserved:
    hostname: console.example.org
    port: 7001
prompt: 'board \#: '
executor:
  stall_nudge_secs: 30
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.target.resolved_kind(), TransportKind::BareRemote);
        let reserved = config.target.reserved.unwrap();
        assert_eq!(reserved.port, Some(7001));
        assert_eq!(reserved.destination(), "console.example.org");
        assert_eq!(config.prompt, r"board \#: ");
        assert_eq!(config.executor.stall_nudge(), Duration::from_secs(30));
        assert_eq!(config.executor.chunk_size, 1024);
    }

    #[test]
    fn test_auto_resolution() {
        let mut target = TargetConfig {
            transport: TransportKind::Auto,
            reserved: Some(Reservation {
                hostname: "localhost".to_string(),
                username: Some("ci".to_string()),
                port: None,
            }),
        };
        assert_eq!(target.resolved_kind(), TransportKind::Local);

        target.reserved.as_mut().unwrap().hostname = "build-01".to_string();
        assert_eq!(target.resolved_kind(), TransportKind::MultiplexedRemote);
        assert_eq!(target.reserved.unwrap().destination(), "ci@build-01");
    }

    #[test]
    fn test_backoff_capped_by_stall_nudge() {
        let executor = ExecutorConfig {
            stall_nudge_secs: 0.5,
            max_backoff_ms: 2000,
            chunk_size: 1024,
        };
        assert_eq!(executor.max_backoff(), Duration::from_millis(500));
    }
}
