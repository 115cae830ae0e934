//! Idle session pool shared by reconciliations targeting the same host.
//!
//! A session is checked out exclusively for one reconciliation and handed
//! back afterwards. Entries expire after the idle timeout and are checked
//! with [`RemoteSession::is_alive`] before reuse.

use super::RemoteSession;
use crate::config::PoolConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Sessions are only interchangeable when all of these match.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Fingerprint of auth material, host key pin and jump chain.
    pub fingerprint: String,
}

struct IdleEntry {
    session: Arc<dyn RemoteSession>,
    since: Instant,
}

pub struct ConnectionPool {
    idle_timeout: Duration,
    max_idle_per_key: usize,
    entries: Mutex<HashMap<PoolKey, Vec<IdleEntry>>>,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            max_idle_per_key: config.max_idle_per_key,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide pool, created on first use. Later calls ignore `config`.
    pub fn global(config: &PoolConfig) -> Arc<ConnectionPool> {
        static POOL: OnceLock<Arc<ConnectionPool>> = OnceLock::new();
        POOL.get_or_init(|| Arc::new(ConnectionPool::new(config)))
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, Vec<IdleEntry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a live idle session for `key`. Expired entries for every key
    /// are closed first.
    pub async fn checkout(&self, key: &PoolKey) -> Option<Arc<dyn RemoteSession>> {
        self.evict_expired().await;
        loop {
            let entry = {
                let mut entries = self.lock();
                let list = entries.get_mut(key)?;
                let entry = list.pop();
                if list.is_empty() {
                    entries.remove(key);
                }
                entry?
            };

            if entry.since.elapsed() >= self.idle_timeout {
                log::debug!("Evicting expired pooled session for {}@{}", key.user, key.host);
                entry.session.close().await;
                continue;
            }
            if entry.session.is_alive().await {
                log::debug!("Reusing pooled session for {}@{}:{}", key.user, key.host, key.port);
                return Some(entry.session);
            }
            log::debug!("Pooled session for {}@{} failed liveness check", key.user, key.host);
            entry.session.close().await;
        }
    }

    /// Return a session after a successful reconciliation.
    pub async fn checkin(&self, key: PoolKey, session: Arc<dyn RemoteSession>) {
        self.evict_expired().await;
        let rejected = {
            let mut entries = self.lock();
            let list = entries.entry(key).or_default();
            if list.len() < self.max_idle_per_key {
                list.push(IdleEntry {
                    session,
                    since: Instant::now(),
                });
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = rejected {
            session.close().await;
        }
    }

    /// Close every entry past its idle lifetime.
    pub async fn evict_expired(&self) -> usize {
        let expired: Vec<Arc<dyn RemoteSession>> = {
            let mut entries = self.lock();
            let mut expired = Vec::new();
            for list in entries.values_mut() {
                let (stale, fresh): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|e| e.since.elapsed() >= self.idle_timeout);
                *list = fresh;
                expired.extend(stale.into_iter().map(|e| e.session));
            }
            entries.retain(|_, list| !list.is_empty());
            expired
        };
        let count = expired.len();
        for session in expired {
            session.close().await;
        }
        count
    }

    /// Close everything. Called on process shutdown.
    pub async fn drain(&self) {
        let all: Vec<IdleEntry> = {
            let mut entries = self.lock();
            entries.drain().flat_map(|(_, list)| list).collect()
        };
        if !all.is_empty() {
            log::info!("Draining {} pooled SSH sessions", all.len());
        }
        for entry in all {
            entry.session.close().await;
        }
    }

    pub fn idle_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}
