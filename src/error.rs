//! Error taxonomy for deployer reconciliations.
//!
//! Every failure surfaced to the caller is a [`DeployError`] naming the
//! lifecycle operation, the phase that failed and the typed cause.

use crate::command::CommandOutput;
use crate::payload::transfer::TransferFailure;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Argument problems detected before any network I/O.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("connection field '{0}' must not be empty")]
    EmptyConnection(&'static str),
    #[error("no authentication method configured")]
    MissingAuth,
    #[error("only one authentication method may be set, found: {0}")]
    ConflictingAuth(String),
    #[error("payload target path '{0}' appears more than once")]
    DuplicatePayloadPath(String),
    #[error("{0} command is empty")]
    EmptyCommand(&'static str),
    #[error("payload asset #{index}: {reason}")]
    InvalidAsset { index: usize, reason: String },
    #[error("invalid environment variable name '{0}'")]
    InvalidEnvName(String),
    #[error("cannot hash {key}: {reason}")]
    UnreadableAsset { key: String, reason: String },
    #[error("connection changed; the resource must be replaced, not updated")]
    ReplaceRequired,
    #[error("cannot {operation} a resource in state {state}")]
    InvalidState { operation: Operation, state: String },
}

/// Why a session could not be established or used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionErrorKind {
    AuthFailed,
    Unreachable,
    Timeout,
    ProtocolError,
}

impl ConnectionErrorKind {
    /// Transport-level failures worth another dial.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unreachable | Self::Timeout)
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AuthFailed => "authentication failed",
            Self::Unreachable => "host unreachable",
            Self::Timeout => "timed out",
            Self::ProtocolError => "protocol error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} ({target}): {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    /// `user@host:port` of the endpoint.
    pub target: String,
    pub message: String,
}

impl ConnectionError {
    pub fn new(
        kind: ConnectionErrorKind,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Why a single payload file could not be materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferErrorKind {
    PermissionDenied,
    PathInvalid,
    DiskFull,
    IoError,
    DuplicatePath,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission denied",
            Self::PathInvalid => "invalid path",
            Self::DiskFull => "disk full",
            Self::IoError => "I/O error",
            Self::DuplicatePath => "duplicate path",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} at {path}: {message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub path: String,
    pub message: String,
}

impl TransferError {
    pub fn new(
        kind: TransferErrorKind,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The command ran to completion with a non-zero status.
    #[error("command exited with status {exit_code}: {}", .output.summary())]
    Failed { exit_code: i32, output: CommandOutput },
    /// The deadline elapsed and the remote process group was killed.
    #[error("command timed out after {}ms", .after.as_millis())]
    TimedOut { after: Duration },
    #[error(transparent)]
    Transport(#[from] ConnectionError),
}

/// Lifecycle transition being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Step of a reconciliation in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Validate,
    Connect,
    Transfer,
    Execute,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validate => "validate",
            Self::Connect => "connect",
            Self::Transfer => "transfer",
            Self::Execute => "execute",
            Self::Cleanup => "cleanup",
        })
    }
}

#[derive(Debug, Error)]
pub enum Cause {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transfer(#[from] TransferFailure),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),
}

/// A failed create, update or delete.
#[derive(Debug, Error)]
#[error("{operation} failed during {phase}: {cause}")]
pub struct DeployError {
    pub operation: Operation,
    pub phase: Phase,
    #[source]
    pub cause: Cause,
}

impl DeployError {
    pub fn new(operation: Operation, phase: Phase, cause: impl Into<Cause>) -> Self {
        Self {
            operation,
            phase,
            cause: cause.into(),
        }
    }

    /// Remote output captured before the failure, if a command ran.
    pub fn captured_output(&self) -> Option<&CommandOutput> {
        match &self.cause {
            Cause::Command(CommandError::Failed { output, .. }) => Some(output),
            _ => None,
        }
    }

    /// True when the session itself is suspect and must not be pooled.
    ///
    /// An `IoError` from a transfer usually means the SFTP channel died; the
    /// session caches that channel, so it cannot be reused.
    pub(crate) fn poisons_session(&self) -> bool {
        match &self.cause {
            Cause::Transfer(failure) => failure.error.kind == TransferErrorKind::IoError,
            Cause::Connection(_)
            | Cause::Command(CommandError::Transport(_))
            | Cause::Command(CommandError::TimedOut { .. })
            | Cause::DeadlineExceeded(_) => true,
            _ => false,
        }
    }
}
