use std::io;

use thiserror::Error;

use crate::config::Host;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("could not connect to {host}: {source}")]
    Connect { host: String, source: io::Error },
    #[error("ssh handshake with {host} failed: {source}")]
    Handshake { host: String, source: ssh2::Error },
    #[error("host key of {0} does not match known_hosts")]
    HostKeyMismatch(String),
    #[error("no identity accepted for {user}@{host}")]
    Auth { host: String, user: String },
    #[error("channel error on {host}: {source}")]
    Channel { host: String, source: ssh2::Error },
    #[error("i/o error on {host}: {source}")]
    Io { host: String, source: io::Error },
}

/// Captured streams of a finished remote command
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Opens a shell on a host
pub trait Connector: Send + Sync {
    type Shell: RemoteShell;

    fn connect(&self, host: &Host) -> Result<Self::Shell, RemoteError>;
}

pub trait RemoteShell: Send {
    /// Issues `cmd` without waiting for it. With `pty` set a pseudo-terminal is
    /// allocated, which merges stderr into stdout on the remote side.
    fn exec(&mut self, cmd: &str, pty: bool) -> Result<Box<dyn RemoteProcess>, RemoteError>;
}

/// A command issued on a [`RemoteShell`]. Dropping it without calling
/// [`RemoteProcess::wait`] detaches from the command.
pub trait RemoteProcess: Send {
    /// Reads both streams to the end and returns them with the exit status
    fn wait(self: Box<Self>) -> Result<CommandOutput, RemoteError>;
}
