//! Core engine - prompt matching, escape filtering, transports, sessions and command execution

mod escape;
mod executor;
mod interaction;
mod prompt;
mod pty;
mod session;
mod transport;

pub use escape::EscapeFilter;
pub use executor::{CommandExecutor, CommandInvocation, CommandResult};
pub use interaction::{Expectation, Interaction};
pub use prompt::{PromptMatch, PromptMatcher};
pub use pty::PtyChannel;
pub use session::{split_lines, SessionState, ShellSession};
pub use transport::{
    transport_for, BareRemoteTransport, LocalTransport, MultiplexedRemoteTransport, Transport,
    RECEIVE_TIMEOUT,
};
