//! Shellpilot - drive interactive shells on local or remote machines
//!
//! A [`ShellSession`] owns one shell over one transport and installs a
//! counter-bearing prompt so the end of every command is unambiguous. The
//! [`CommandExecutor`] layers the send/await/verify protocol on top, and
//! [`CheckoutReconciler`] uses it to fetch or update source trees.

pub mod checkout;
pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod password;

// Re-exports
pub use checkout::{CheckoutHandle, CheckoutReconciler, CheckoutRequest, Vcs};
pub use config::{Config, Reservation, TargetConfig, TransportKind};
pub use crate::core::{
    CommandExecutor, CommandInvocation, CommandResult, EscapeFilter, Expectation, PromptMatch,
    PromptMatcher, SessionState, ShellSession, Transport,
};
pub use error::{Result, ShellError};
pub use password::{
    password_source_from_env, FixedPassword, PasswordSource, SharedPassword, TerminalPrompt,
    SUDO_PASSWORD_ENV,
};
