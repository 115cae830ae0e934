pub mod manager;
pub mod pool;
pub mod session;
pub mod sftp;

#[cfg(test)]
pub(crate) mod mock;

use crate::crypto;
use crate::error::{ConnectionError, TransferError, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_DIAL_ERROR_LIMIT: u32 = 10;
pub const DEFAULT_PER_DIAL_TIMEOUT_SECS: u64 = 15;

/// SSH connection configuration.
///
/// Deserializes from the flat [`ConnectionArgs`] wire shape and is
/// validated on the way in, so a `Connection` always carries exactly one
/// authentication method.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConnectionArgs", into = "ConnectionArgs")]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
    /// Expected server public key, OpenSSH format. `None` accepts any key.
    pub host_key: Option<String>,
    /// Jump host the connection is tunnelled through.
    pub proxy: Option<Box<Connection>>,
    /// Failed dials tolerated before giving up.
    pub dial_error_limit: u32,
    pub per_dial_timeout: Duration,
}

/// SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    /// Private key material (PEM / OpenSSH format).
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
    /// Agent at `socket`, or `SSH_AUTH_SOCK` when unset.
    Agent { socket: Option<String> },
}

impl SshAuth {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKey { .. } => "private key",
            Self::KeyFile { .. } => "key file",
            Self::Agent { .. } => "agent",
        }
    }

    fn secret_material(&self) -> Vec<&[u8]> {
        match self {
            Self::Password(p) => vec![&b"password"[..], p.as_bytes()],
            Self::PrivateKey { key, passphrase } => vec![
                &b"key"[..],
                key.as_bytes(),
                passphrase.as_deref().unwrap_or("").as_bytes(),
            ],
            Self::KeyFile { path, passphrase } => vec![
                &b"keyfile"[..],
                path.as_bytes(),
                passphrase.as_deref().unwrap_or("").as_bytes(),
            ],
            Self::Agent { socket } => {
                vec![&b"agent"[..], socket.as_deref().unwrap_or("").as_bytes()]
            }
        }
    }
}

// Secrets stay out of logs and error messages.
impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey { .. } => f.write_str("PrivateKey(<redacted>)"),
            Self::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
            Self::Agent { socket } => f.debug_struct("Agent").field("socket", socket).finish(),
        }
    }
}

impl Connection {
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            auth,
            host_key: None,
            proxy: None,
            dial_error_limit: DEFAULT_DIAL_ERROR_LIMIT,
            per_dial_timeout: Duration::from_secs(DEFAULT_PER_DIAL_TIMEOUT_SECS),
        }
    }

    /// `user@host:port`, used in logs, errors and resource ids.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Re-check invariants for values built in code rather than deserialized.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyConnection("host"));
        }
        if self.user.trim().is_empty() {
            return Err(ValidationError::EmptyConnection("user"));
        }
        if self.port == 0 {
            return Err(ValidationError::EmptyConnection("port"));
        }
        match &self.auth {
            SshAuth::Password(p) if p.is_empty() => return Err(ValidationError::MissingAuth),
            SshAuth::PrivateKey { key, .. } if key.trim().is_empty() => {
                return Err(ValidationError::MissingAuth)
            }
            SshAuth::KeyFile { path, .. } if path.trim().is_empty() => {
                return Err(ValidationError::MissingAuth)
            }
            _ => {}
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }

    /// Pool key: endpoint plus a fingerprint of everything that makes two
    /// sessions interchangeable (auth, host key pin, jump chain).
    pub fn pool_key(&self) -> pool::PoolKey {
        let proxy_fp = self
            .proxy
            .as_ref()
            .map(|p| p.pool_key().fingerprint)
            .unwrap_or_default();
        let mut parts = self.auth.secret_material();
        parts.push(self.host_key.as_deref().unwrap_or("").as_bytes());
        parts.push(proxy_fp.as_bytes());
        pool::PoolKey {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            fingerprint: crypto::fingerprint(&parts),
        }
    }
}

/// Flat connection arguments as supplied by the declarative harness.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_socket_path: Option<String>,
    /// Use the agent from `SSH_AUTH_SOCK`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Box<ConnectionArgs>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_error_limit: Option<u32>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_dial_timeout: Option<u64>,
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::EmptyConnection(field)),
    }
}

impl TryFrom<ConnectionArgs> for Connection {
    type Error = ValidationError;

    fn try_from(args: ConnectionArgs) -> Result<Self, Self::Error> {
        let host = non_empty(args.host, "host")?;
        let user = non_empty(args.user, "user")?;

        let mut selected = Vec::new();
        if args.password.is_some() {
            selected.push("password");
        }
        if args.private_key.is_some() {
            selected.push("privateKey");
        }
        if args.private_key_path.is_some() {
            selected.push("privateKeyPath");
        }
        if args.agent_socket_path.is_some() || args.agent == Some(true) {
            selected.push("agent");
        }
        if selected.len() > 1 {
            return Err(ValidationError::ConflictingAuth(selected.join(", ")));
        }

        let passphrase = args.private_key_password;
        let auth = if let Some(password) = args.password {
            SshAuth::Password(password)
        } else if let Some(key) = args.private_key {
            SshAuth::PrivateKey { key, passphrase }
        } else if let Some(path) = args.private_key_path {
            SshAuth::KeyFile { path, passphrase }
        } else if !selected.is_empty() {
            SshAuth::Agent {
                socket: args.agent_socket_path,
            }
        } else {
            return Err(ValidationError::MissingAuth);
        };

        let proxy = match args.proxy {
            Some(proxy) => Some(Box::new(Connection::try_from(*proxy)?)),
            None => None,
        };

        let connection = Connection {
            host,
            port: args.port.unwrap_or(DEFAULT_PORT),
            user,
            auth,
            host_key: args.host_key.filter(|k| !k.trim().is_empty()),
            proxy,
            dial_error_limit: args.dial_error_limit.unwrap_or(DEFAULT_DIAL_ERROR_LIMIT),
            per_dial_timeout: Duration::from_secs(
                args.per_dial_timeout.unwrap_or(DEFAULT_PER_DIAL_TIMEOUT_SECS),
            ),
        };
        connection.validate()?;
        Ok(connection)
    }
}

impl From<Connection> for ConnectionArgs {
    fn from(c: Connection) -> Self {
        let mut args = ConnectionArgs {
            host: Some(c.host),
            port: Some(c.port),
            user: Some(c.user),
            host_key: c.host_key,
            proxy: c.proxy.map(|p| Box::new(ConnectionArgs::from(*p))),
            dial_error_limit: Some(c.dial_error_limit),
            per_dial_timeout: Some(c.per_dial_timeout.as_secs()),
            ..Default::default()
        };
        match c.auth {
            SshAuth::Password(p) => args.password = Some(p),
            SshAuth::PrivateKey { key, passphrase } => {
                args.private_key = Some(key);
                args.private_key_password = passphrase;
            }
            SshAuth::KeyFile { path, passphrase } => {
                args.private_key_path = Some(path);
                args.private_key_password = passphrase;
            }
            SshAuth::Agent { socket: Some(path) } => args.agent_socket_path = Some(path),
            SshAuth::Agent { socket: None } => args.agent = Some(true),
        }
        args
    }
}

/// Result of one remote process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process died from a signal.
    pub exit_status: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

/// An authenticated session: file operations plus remote exec.
///
/// Implemented over russh/SFTP by [`session::SshSession`]; the transfer
/// engine and command executor only see this trait.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `mkdir -p` semantics.
    async fn create_dir_all(&self, path: &str) -> Result<(), TransferError>;

    /// Replace `path` with `contents`, applying `mode` when given.
    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), TransferError>;

    async fn remove_file(&self, path: &str) -> Result<(), TransferError>;

    /// Run `command` through the remote shell and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError>;

    /// Cheap liveness check used before reusing a pooled session.
    async fn is_alive(&self) -> bool;

    async fn close(&self);
}
