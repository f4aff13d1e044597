//! Error types shared by sessions, the executor and the checkout layer

use crate::config::TransportKind;
use thiserror::Error;

/// Errors raised while driving a shell
#[derive(Debug, Error)]
pub enum ShellError {
    /// The command finished but `echo $?` reported a non-zero or unreadable code
    #[error("command `{command}` failed with return code {}", display_code(.return_code))]
    CommandFailed {
        command: String,
        return_code: Option<i32>,
        output: Vec<String>,
    },

    /// The reconnect budget ran out; the job cannot continue
    #[error("unable to reconnect after {attempts} attempts, giving up")]
    ConnectionExhausted { attempts: u32 },

    /// A remote transport was requested without a reserved machine
    #[error("machine request not implemented for {0} transport, please provide a reserved target")]
    UnimplementedTransport(TransportKind),

    #[error("shell never presented prompt `{prompt}`")]
    HandshakeTimeout { prompt: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{operation} is not supported by the {transport} transport")]
    Unsupported {
        operation: &'static str,
        transport: TransportKind,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ShellError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Return code carried by a `CommandFailed`, if any
    pub fn return_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { return_code, .. } => *return_code,
            _ => None,
        }
    }

    /// Captured output carried by a `CommandFailed`
    pub fn command_output(&self) -> &[String] {
        match self {
            Self::CommandFailed { output, .. } => output,
            _ => &[],
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<unreadable>".to_string(),
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ShellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = ShellError::CommandFailed {
            command: "false".to_string(),
            return_code: Some(1),
            output: vec![],
        };
        assert_eq!(err.to_string(), "command `false` failed with return code 1");
        assert_eq!(err.return_code(), Some(1));

        let err = ShellError::CommandFailed {
            command: "x".to_string(),
            return_code: None,
            output: vec!["oops".to_string()],
        };
        assert!(err.to_string().ends_with("<unreadable>"));
        assert_eq!(err.command_output(), ["oops".to_string()]);
    }
}
