//! In-memory remote used by unit tests. Records every operation so tests
//! can assert what reached the "network".

use super::manager::Dialer;
use super::{Connection, ExecOutput, RemoteSession};
use crate::error::{ConnectionError, ConnectionErrorKind, TransferError, TransferErrorKind};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MockFile {
    pub contents: Vec<u8>,
    pub mode: Option<u32>,
}

#[derive(Default)]
struct RemoteState {
    files: BTreeMap<String, MockFile>,
    dirs: BTreeSet<String>,
    writes: Vec<String>,
    removed: Vec<String>,
    commands: Vec<String>,
    exec_results: VecDeque<ExecOutput>,
    fail_writes: HashMap<String, TransferErrorKind>,
    hang_marker: Option<String>,
    closed: usize,
}

/// Shared remote host state; every session dialed to it sees the same files.
#[derive(Clone, Default)]
pub(crate) struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.lock().files.get(path).cloned()
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.lock().files.insert(
            path.to_string(),
            MockFile {
                contents: contents.to_vec(),
                mode: None,
            },
        );
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn closed_sessions(&self) -> usize {
        self.lock().closed
    }

    /// Queue the result of the next exec; unqueued execs exit 0.
    pub fn push_exec_result(&self, exit_status: Option<u32>, stdout: &str, stderr: &str) {
        self.lock().exec_results.push_back(ExecOutput {
            exit_status,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    pub fn fail_write(&self, path: &str, kind: TransferErrorKind) {
        self.lock().fail_writes.insert(path.to_string(), kind);
    }

    /// Execs whose command contains `marker` never finish.
    pub fn hang_on(&self, marker: &str) {
        self.lock().hang_marker = Some(marker.to_string());
    }
}

pub(crate) struct MockSession {
    remote: MockRemote,
    alive: AtomicBool,
}

impl MockSession {
    pub fn new(remote: &MockRemote) -> Self {
        Self {
            remote: remote.clone(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn create_dir_all(&self, path: &str) -> Result<(), TransferError> {
        let mut state = self.remote.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            state.dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), TransferError> {
        let mut state = self.remote.lock();
        if let Some(kind) = state.fail_writes.get(path) {
            return Err(TransferError::new(*kind, path, "injected failure"));
        }
        state.writes.push(path.to_string());
        state.files.insert(
            path.to_string(),
            MockFile {
                contents: contents.to_vec(),
                mode,
            },
        );
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        let mut state = self.remote.lock();
        if state.files.remove(path).is_none() {
            return Err(TransferError::new(
                TransferErrorKind::PathInvalid,
                path,
                "no such file",
            ));
        }
        state.removed.push(path.to_string());
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError> {
        let (hang, result) = {
            let mut state = self.remote.lock();
            state.commands.push(command.to_string());
            let hang = state
                .hang_marker
                .as_deref()
                .is_some_and(|m| command.contains(m));
            let result = if hang {
                None
            } else {
                Some(state.exec_results.pop_front().unwrap_or(ExecOutput {
                    exit_status: Some(0),
                    ..Default::default()
                }))
            };
            (hang, result)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(result.unwrap_or_default())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.remote.lock().closed += 1;
    }
}

/// Dialer that fails the first `failures` attempts.
pub(crate) struct MockDialer {
    remote: MockRemote,
    failures: usize,
    kind: ConnectionErrorKind,
    attempts: AtomicUsize,
}

impl MockDialer {
    pub fn new(remote: &MockRemote) -> Self {
        Self::failing(remote, 0, ConnectionErrorKind::Unreachable)
    }

    pub fn failing(remote: &MockRemote, failures: usize, kind: ConnectionErrorKind) -> Self {
        Self {
            remote: remote.clone(),
            failures,
            kind,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        connection: &Connection,
    ) -> Result<Arc<dyn RemoteSession>, ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(ConnectionError::new(
                self.kind,
                connection.target(),
                format!("injected dial failure #{}", attempt),
            ));
        }
        Ok(Arc::new(MockSession::new(&self.remote)))
    }
}
