//! Session relay types.

use std::fmt;
use std::str::FromStr;

use crate::channel::Channel;
use crate::transport::TransportError;

/// Opaque session identifier chosen by the UI.
pub type SessionId = uuid::Uuid;

/// What kind of stream a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    /// Exec with a TTY: input, output and error; output is not replayable.
    Interactive,
    /// Attach to the container's stdout only.
    StdoutOnly,
    /// Attach to the container's stderr only.
    StderrOnly,
    /// Attach to stdout and stderr.
    CombinedLogs,
    /// Follow the container log from the start.
    FollowLogs,
}

impl ConnectionMode {
    pub const fn is_interactive(self) -> bool {
        matches!(self, Self::Interactive)
    }

    /// Whether viewer input is forwarded to the remote.
    pub const fn has_input(self) -> bool {
        self.is_interactive()
    }

    /// Channels that get a reader task.
    pub fn inbound_channels(self) -> &'static [Channel] {
        match self {
            Self::Interactive | Self::CombinedLogs => &[Channel::Stdout, Channel::Stderr],
            Self::StdoutOnly | Self::FollowLogs => &[Channel::Stdout],
            Self::StderrOnly => &[Channel::Stderr],
        }
    }

    /// Line recorded when the remote ends the stream.
    pub const fn closed_marker(self) -> &'static str {
        match self {
            Self::FollowLogs => "Log stream closed.",
            _ => "Connection closed.",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::StdoutOnly => "stdout",
            Self::StderrOnly => "stderr",
            Self::CombinedLogs => "logs",
            Self::FollowLogs => "follow-logs",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown connection mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for ConnectionMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" | "bash" | "sh" => Ok(Self::Interactive),
            "stdout" => Ok(Self::StdoutOnly),
            "stderr" => Ok(Self::StderrOnly),
            "logs" | "all-logs" => Ok(Self::CombinedLogs),
            "follow-logs" => Ok(Self::FollowLogs),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

/// Remote workload a session points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    /// Command for exec sessions. `None` means the configured default shell.
    pub command: Option<Vec<String>>,
}

impl Target {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
            command: None,
        }
    }

    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: Option<Vec<String>>) -> Self {
        self.command = command;
        self
    }

    /// Split a UI command string into argv. Blank input yields `None`.
    pub fn parse_command(command: &str) -> Option<Vec<String>> {
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        (!argv.is_empty()).then_some(argv)
    }

    pub fn resolved_command(&self, default_shell: &[String]) -> Vec<String> {
        match &self.command {
            Some(argv) if !argv.is_empty() => argv.clone(),
            _ => default_shell.to_vec(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)?;
        if let Some(container) = &self.container {
            write!(f, "/{container}")?;
        }
        Ok(())
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Running,
    Closed,
}

/// Errors returned to callers of the session relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to open session: {0}")]
    Open(#[from] TransportError),

    #[error("Session already opened")]
    AlreadyOpened,

    #[error("Session is closed")]
    Closed,
}
