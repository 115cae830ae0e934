//! Session acquisition.
//!
//! [`Dialer`] performs exactly one dial + handshake + authentication.
//! [`ConnectionManager::acquire`] adds the transport-level retry (bounded by
//! the connection's `dial_error_limit`, exponential backoff from
//! [`DialConfig`]) and the pool lookup, and hands back a [`SessionLease`]
//! that is released on every exit path.

use super::pool::{ConnectionPool, PoolKey};
use super::session::SshSession;
use super::{Connection, RemoteSession, SshAuth};
use crate::config::DialConfig;
use crate::error::{ConnectionError, ConnectionErrorKind};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        connection: &Connection,
    ) -> Result<Arc<dyn RemoteSession>, ConnectionError>;
}

/// Dials real SSH servers through russh.
pub struct SshDialer;

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        connection: &Connection,
    ) -> Result<Arc<dyn RemoteSession>, ConnectionError> {
        let session = SshSession::connect(connection).await?;
        Ok(Arc::new(session))
    }
}

pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    dial: DialConfig,
    pool: Option<Arc<ConnectionPool>>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, dial: DialConfig) -> Self {
        Self {
            dialer,
            dial,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    /// Get an authenticated session for `connection`, from the pool when a
    /// live one is idle, otherwise by dialing.
    pub async fn acquire(&self, connection: &Connection) -> Result<SessionLease, ConnectionError> {
        preflight(connection)?;
        let key = connection.pool_key();

        if let Some(pool) = &self.pool {
            if let Some(session) = pool.checkout(&key).await {
                return Ok(SessionLease::new(session, key, Some(pool.clone())));
            }
        }

        let session = self.dial_with_retry(connection).await?;
        Ok(SessionLease::new(session, key, self.pool.clone()))
    }

    async fn dial_with_retry(
        &self,
        connection: &Connection,
    ) -> Result<Arc<dyn RemoteSession>, ConnectionError> {
        let target = connection.target();
        let mut failures: u32 = 0;
        loop {
            let attempt = failures + 1;
            log::debug!("Dialing {} (attempt {})", target, attempt);
            let result = match tokio::time::timeout(
                connection.per_dial_timeout,
                self.dialer.dial(connection),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::new(
                    ConnectionErrorKind::Timeout,
                    &target,
                    format!("no answer within {:?}", connection.per_dial_timeout),
                )),
            };

            match result {
                Ok(session) => {
                    log::info!("SSH connected to {} after {} attempt(s)", target, attempt);
                    return Ok(session);
                }
                Err(e) if e.kind.is_retryable() && failures < connection.dial_error_limit => {
                    failures += 1;
                    let delay = self.dial.backoff(failures);
                    log::warn!("Dial to {} failed ({}), retrying in {:?}", target, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!("Giving up on {} after {} attempt(s): {}", target, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Check that the selected auth method can be resolved at all, before
/// touching the network.
fn preflight(connection: &Connection) -> Result<(), ConnectionError> {
    let auth_failed = |msg: String| {
        ConnectionError::new(ConnectionErrorKind::AuthFailed, connection.target(), msg)
    };
    match &connection.auth {
        SshAuth::KeyFile { path, .. } if !Path::new(path).is_file() => {
            return Err(auth_failed(format!("private key file {} not found", path)));
        }
        SshAuth::Agent { socket } => {
            let socket = match socket {
                Some(s) => s.clone(),
                None => std::env::var("SSH_AUTH_SOCK")
                    .map_err(|_| auth_failed("SSH_AUTH_SOCK is not set".to_string()))?,
            };
            if !Path::new(&socket).exists() {
                return Err(auth_failed(format!("agent socket {} not found", socket)));
            }
        }
        _ => {}
    }
    match &connection.proxy {
        Some(proxy) => preflight(proxy),
        None => Ok(()),
    }
}

/// Exclusive use of one session for the length of a reconciliation.
///
/// Call [`release`](Self::release) or [`discard`](Self::discard). A lease
/// dropped without either (cancellation, panic) closes its session in the
/// background, unless another holder of the session is still cleaning up.
pub struct SessionLease {
    session: Arc<dyn RemoteSession>,
    key: PoolKey,
    pool: Option<Arc<ConnectionPool>>,
    finished: bool,
}

impl SessionLease {
    fn new(
        session: Arc<dyn RemoteSession>,
        key: PoolKey,
        pool: Option<Arc<ConnectionPool>>,
    ) -> Self {
        Self {
            session,
            key,
            pool,
            finished: false,
        }
    }

    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }

    /// Owned handle, for work that may outlive the lease (remote kill on
    /// cancellation).
    pub fn shared(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    /// Hand the session back to the pool, or close it when pooling is off.
    pub async fn release(mut self) {
        self.finished = true;
        let session = self.session.clone();
        match self.pool.take() {
            Some(pool) => pool.checkin(self.key.clone(), session).await,
            None => session.close().await,
        }
    }

    /// Close the session without pooling it.
    pub async fn discard(mut self) {
        self.finished = true;
        self.session.close().await;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Someone still holds the session (a pending remote kill); they close it.
        if Arc::strong_count(&self.session) > 1 {
            log::debug!("Session lease dropped unreleased, cleanup left to its other holder");
            return;
        }
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::debug!("Session lease dropped unreleased, closing in background");
                handle.spawn(async move { session.close().await });
            }
            Err(_) => log::warn!("Session lease dropped outside a runtime; socket closes on drop"),
        }
    }
}
