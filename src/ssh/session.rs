use super::sftp::SftpClient;
use super::{Connection, ExecOutput, RemoteSession, SshAuth};
use crate::error::{ConnectionError, ConnectionErrorKind, TransferError, TransferErrorKind};
use async_trait::async_trait;
use russh::keys::*;
use russh::*;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// An authenticated russh session, optionally tunnelled through a jump host.
pub struct SshSession {
    target: String,
    handle: client::Handle<SshHandler>,
    sftp: OnceCell<SftpClient>,
    /// Keeps the jump host session (and its tunnel) alive.
    jump: Option<Box<SshSession>>,
}

/// Client handler; pins the server key when the connection names one.
struct SshHandler {
    target: String,
    host_key: Option<ssh_key::PublicKey>,
}

impl client::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.host_key {
            Some(expected) => {
                let matches = expected.key_data() == server_public_key.key_data();
                if !matches {
                    log::error!(
                        "Host key mismatch for {}: got {}",
                        self.target,
                        server_public_key.fingerprint(ssh_key::HashAlg::Sha256)
                    );
                }
                Ok(matches)
            }
            None => {
                log::warn!(
                    "No host key pinned for {}, accepting {}",
                    self.target,
                    server_public_key.fingerprint(ssh_key::HashAlg::Sha256)
                );
                Ok(true)
            }
        }
    }
}

impl SshSession {
    /// Dial, handshake and authenticate. Jump hosts are connected first and
    /// the target is reached through a direct-tcpip channel.
    pub async fn connect(connection: &Connection) -> Result<Self, ConnectionError> {
        let target = connection.target();
        let host_key = match &connection.host_key {
            Some(k) => Some(ssh_key::PublicKey::from_openssh(k).map_err(|e| {
                ConnectionError::new(
                    ConnectionErrorKind::ProtocolError,
                    &target,
                    format!("invalid host_key: {}", e),
                )
            })?),
            None => None,
        };
        let handler = SshHandler {
            target: target.clone(),
            host_key,
        };
        let config = Arc::new(client::Config::default());

        let (mut handle, jump) = match &connection.proxy {
            None => {
                let handle = client::connect(
                    config,
                    (connection.host.as_str(), connection.port),
                    handler,
                )
                .await
                .map_err(|e| classify_dial_error(&target, e))?;
                (handle, None)
            }
            Some(proxy) => {
                let jump = Box::pin(SshSession::connect(proxy)).await?;
                let channel = jump
                    .handle
                    .channel_open_direct_tcpip(
                        connection.host.clone(),
                        u32::from(connection.port),
                        "127.0.0.1",
                        0,
                    )
                    .await
                    .map_err(|e| {
                        ConnectionError::new(
                            ConnectionErrorKind::Unreachable,
                            &target,
                            format!("tunnel through {} failed: {}", jump.target, e),
                        )
                    })?;
                let handle = client::connect_stream(config, channel.into_stream(), handler)
                    .await
                    .map_err(|e| classify_dial_error(&target, e))?;
                (handle, Some(Box::new(jump)))
            }
        };

        authenticate(&mut handle, connection).await?;
        log::info!("SSH authenticated to {} ({})", target, connection.auth.mode());

        Ok(Self {
            target,
            handle,
            sftp: OnceCell::new(),
            jump,
        })
    }

    fn transport_error(&self, context: &str, err: russh::Error) -> ConnectionError {
        ConnectionError::new(
            ConnectionErrorKind::ProtocolError,
            &self.target,
            format!("{}: {}", context, err),
        )
    }

    async fn sftp(&self) -> Result<&SftpClient, TransferError> {
        self.sftp
            .get_or_try_init(|| async {
                let channel = self.handle.channel_open_session().await.map_err(|e| {
                    let message = format!("sftp channel: {}", e);
                    TransferError::new(TransferErrorKind::IoError, "", message)
                })?;
                SftpClient::init(channel).await
            })
            .await
    }
}

async fn authenticate(
    handle: &mut client::Handle<SshHandler>,
    connection: &Connection,
) -> Result<(), ConnectionError> {
    let target = connection.target();
    let user = connection.user.as_str();
    let auth_failed =
        |msg: String| ConnectionError::new(ConnectionErrorKind::AuthFailed, &target, msg);
    let protocol = |e: russh::Error| {
        ConnectionError::new(ConnectionErrorKind::ProtocolError, &target, e.to_string())
    };

    let success = match &connection.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(user, password.as_str())
            .await
            .map_err(protocol)?
            .success(),
        SshAuth::PrivateKey { key, passphrase } => {
            let key_pair = decode_secret_key(key, passphrase.as_deref())
                .map_err(|e| auth_failed(format!("cannot parse private key: {}", e)))?;
            authenticate_key(handle, user, key_pair).await.map_err(protocol)?
        }
        SshAuth::KeyFile { path, passphrase } => {
            let key_pair = load_secret_key(path, passphrase.as_deref())
                .map_err(|e| auth_failed(format!("cannot load {}: {}", path, e)))?;
            authenticate_key(handle, user, key_pair).await.map_err(protocol)?
        }
        SshAuth::Agent { socket } => {
            let mut agent = match socket {
                Some(path) => agent::client::AgentClient::connect_uds(path).await,
                None => agent::client::AgentClient::connect_env().await,
            }
            .map_err(|e| auth_failed(format!("SSH agent unreachable: {}", e)))?;
            let identities = agent
                .request_identities()
                .await
                .map_err(|e| auth_failed(format!("SSH agent refused to list keys: {}", e)))?;
            let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();

            let mut success = false;
            for identity in identities {
                let agent::AgentIdentity::PublicKey { key, .. } = identity else {
                    continue;
                };
                let result = handle
                    .authenticate_publickey_with(user, key, hash_alg, &mut agent)
                    .await
                    .map_err(|e| auth_failed(format!("agent signing failed: {}", e)))?;
                if result.success() {
                    success = true;
                    break;
                }
            }
            success
        }
    };

    if success {
        Ok(())
    } else {
        Err(auth_failed(format!(
            "server rejected {} authentication",
            connection.auth.mode()
        )))
    }
}

async fn authenticate_key(
    handle: &mut client::Handle<SshHandler>,
    user: &str,
    key_pair: PrivateKey,
) -> Result<bool, russh::Error> {
    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    let pk = PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
    Ok(handle.authenticate_publickey(user, pk).await?.success())
}

/// Map a connect/handshake failure onto the error taxonomy.
fn classify_dial_error(target: &str, err: anyhow::Error) -> ConnectionError {
    let kind = if let Some(io) = err.downcast_ref::<std::io::Error>() {
        io_kind(io)
    } else if let Some(russh_err) = err.downcast_ref::<russh::Error>() {
        match russh_err {
            russh::Error::IO(io) => io_kind(io),
            russh::Error::ConnectionTimeout => ConnectionErrorKind::Timeout,
            _ => ConnectionErrorKind::ProtocolError,
        }
    } else {
        ConnectionErrorKind::ProtocolError
    };
    ConnectionError::new(kind, target, err.to_string())
}

fn io_kind(err: &std::io::Error) -> ConnectionErrorKind {
    match err.kind() {
        std::io::ErrorKind::TimedOut => ConnectionErrorKind::Timeout,
        _ => ConnectionErrorKind::Unreachable,
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn create_dir_all(&self, path: &str) -> Result<(), TransferError> {
        self.sftp().await?.create_dir_all(path).await
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), TransferError> {
        self.sftp().await?.write_atomic(path, contents, mode).await
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        self.sftp().await?.remove_file(path).await
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.transport_error("open channel", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.transport_error("exec", e))?;

        let mut exit_status = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        // Keep reading after ExitStatus: data may still be in flight until close.
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    log::warn!("Remote process on {} killed by {:?}", self.target, signal_name);
                }
                _ => {}
            }
        }

        Ok(ExecOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn is_alive(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        match self.handle.channel_open_session().await {
            Ok(channel) => {
                let _ = channel.close().await;
                true
            }
            Err(_) => false,
        }
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            log::debug!("Disconnect from {} failed: {}", self.target, e);
        }
        if let Some(jump) = &self.jump {
            jump.close().await;
        }
        log::info!("SSH disconnected from {}", self.target);
    }
}
