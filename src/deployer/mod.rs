//! Lifecycle orchestration for the SSH deployer resource.
//!
//! Each call reconciles one resource through one transition:
//!
//! - create: connect, transfer payload, run `create`
//! - update: connect, re-transfer payload, run `update`
//! - delete: connect, run `delete`, optionally remove the payload
//!
//! Steps run strictly in order and the first failure aborts the rest, tagged
//! with the phase it happened in. One session serves every step of a
//! transition and is released on every exit path.

pub mod diff;

use crate::command::{validate_environment, CommandDefinition, CommandExecutor, CommandResult};
use crate::config::RunnerConfig;
use crate::error::{Cause, DeployError, Operation, Phase, ValidationError};
use crate::payload::transfer::TransferEngine;
use crate::payload::{self, FileAsset};
use crate::ssh::manager::{ConnectionManager, SessionLease, SshDialer};
use crate::ssh::pool::ConnectionPool;
use crate::ssh::{Connection, RemoteSession};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub use diff::DiffResponse;

/// Declared inputs of one deployer resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployerArgs {
    pub connection: Connection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<FileAsset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<CommandDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<CommandDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<CommandDefinition>,
    /// Remove every transferred file after the delete command succeeds.
    #[serde(default)]
    pub remove_payload_on_delete: bool,
}

impl DeployerArgs {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            environment: BTreeMap::new(),
            payload: Vec::new(),
            create: None,
            update: None,
            delete: None,
            remove_payload_on_delete: false,
        }
    }

    fn commands(&self) -> [(&'static str, Option<&CommandDefinition>); 3] {
        [
            ("create", self.create.as_ref()),
            ("update", self.update.as_ref()),
            ("delete", self.delete.as_ref()),
        ]
    }

    /// Everything checkable without touching the network.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection.validate()?;
        validate_environment(&self.environment)?;
        payload::validate_payloads(&[self.payload.as_slice()])?;
        for (name, command) in self.commands() {
            if let Some(command) = command {
                command.validate(name)?;
                let both = [self.payload.as_slice(), command.payload.as_slice()];
                payload::validate_payloads(&both)?;
            }
        }
        Ok(())
    }

    /// Content hashes of the resource payload and every command payload.
    pub fn payload_hashes(
        &self,
    ) -> Result<BTreeMap<String, String>, (String, std::io::Error)> {
        let mut scoped: Vec<(&str, &[FileAsset])> =
            vec![("payload", self.payload.as_slice())];
        for (scope, command) in [
            ("create.payload", &self.create),
            ("update.payload", &self.update),
            ("delete.payload", &self.delete),
        ] {
            if let Some(command) = command {
                scoped.push((scope, command.payload.as_slice()));
            }
        }
        payload::payload_hashes(&scoped)
    }

    /// Resource payload followed by the command's own payload.
    fn transfer_set(&self, command: Option<&CommandDefinition>) -> Vec<FileAsset> {
        let mut assets = self.payload.clone();
        if let Some(command) = command {
            assets.extend(command.payload.iter().cloned());
        }
        assets
    }

    /// Every remote path any transition may have written.
    fn all_payload_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        let command_payloads = self
            .commands()
            .into_iter()
            .filter_map(|(_, c)| c)
            .flat_map(|c| c.payload.iter());
        for asset in self.payload.iter().chain(command_payloads) {
            if !paths.contains(&asset.filename) {
                paths.push(asset.filename.clone());
            }
        }
        paths
    }
}

/// Position of a resource in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Uncreated,
    Creating,
    Created,
    Updating,
    Deleting,
    Deleted,
    Error,
}

impl ResourceState {
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Uncreated, Creating)
                | (Creating, Created)
                | (Created, Updating)
                | (Updating, Created)
                | (Created, Deleting)
                | (Deleting, Deleted)
                | (Creating, Error)
                | (Updating, Error)
                | (Deleting, Error)
        )
    }
}

fn in_flight(operation: Operation) -> ResourceState {
    match operation {
        Operation::Create => ResourceState::Creating,
        Operation::Update => ResourceState::Updating,
        Operation::Delete => ResourceState::Deleting,
    }
}

fn settled(operation: Operation) -> ResourceState {
    match operation {
        Operation::Create | Operation::Update => ResourceState::Created,
        Operation::Delete => ResourceState::Deleted,
    }
}

/// Results of the last successful create or update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
    /// Exit code of the last command run; `None` when none was defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Remote paths written by the last transfer.
    #[serde(default)]
    pub transferred: Vec<String>,
}

/// What the harness persists between calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployerState {
    /// `user@host:port/name`; independent of payload and commands.
    pub id: String,
    pub status: ResourceState,
    #[serde(flatten)]
    pub args: DeployerArgs,
    #[serde(default)]
    pub payload_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Outputs,
}

pub fn resource_id(name: &str, connection: &Connection) -> String {
    format!("{}/{}", connection.target(), name)
}

/// Per-call knobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileOptions {
    /// Validate and compute hashes only; create and update do no I/O.
    pub preview: bool,
    /// Overall deadline for the reconciliation.
    pub timeout: Option<Duration>,
}

/// In-flight bookkeeping for one reconciliation.
struct Reconciliation {
    operation: Operation,
    id: String,
    state: ResourceState,
    budget: Option<Duration>,
    deadline: Option<Instant>,
}

impl Reconciliation {
    fn begin(
        operation: Operation,
        id: &str,
        from: ResourceState,
        budget: Option<Duration>,
    ) -> Result<Self, DeployError> {
        let next = in_flight(operation);
        if !from.can_transition_to(next) {
            return Err(DeployError::new(
                operation,
                Phase::Validate,
                ValidationError::InvalidState {
                    operation,
                    state: format!("{:?}", from),
                },
            ));
        }
        log::info!("{}: {:?} -> {:?}", id, from, next);
        Ok(Self {
            operation,
            id: id.to_string(),
            state: next,
            budget,
            deadline: budget.map(|b| Instant::now() + b),
        })
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn fail(&mut self, phase: Phase, cause: impl Into<Cause>) -> DeployError {
        let err = DeployError::new(self.operation, phase, cause);
        log::error!("{}: {:?} -> Error: {}", self.id, self.state, err);
        self.state = ResourceState::Error;
        err
    }

    fn complete(&mut self) -> ResourceState {
        let next = settled(self.operation);
        log::info!("{}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        next
    }

    /// Await `step` within the remaining budget, tagging failures with `phase`.
    async fn bounded<T, E, F>(&mut self, phase: Phase, step: F) -> Result<T, DeployError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<Cause>,
    {
        let result = match self.remaining() {
            None => step.await,
            Some(left) => match tokio::time::timeout(left, step).await {
                Ok(result) => result,
                Err(_) => {
                    let budget = self.budget.unwrap_or_default();
                    return Err(self.fail(phase, Cause::DeadlineExceeded(budget)));
                }
            },
        };
        result.map_err(|e| self.fail(phase, e))
    }
}

/// Files written and the command result of one create/update.
struct Applied {
    transferred: Vec<String>,
    command: Option<CommandResult>,
}

impl Applied {
    fn into_outputs(self, previous: Option<&Outputs>) -> Outputs {
        match (self.command, previous) {
            (Some(result), _) => Outputs {
                exit_code: Some(result.exit_code),
                stdout: result.output.stdout,
                stderr: result.output.stderr,
                transferred: self.transferred,
            },
            // No command this time: keep what the last one reported.
            (None, Some(previous)) => Outputs {
                transferred: self.transferred,
                ..previous.clone()
            },
            (None, None) => Outputs {
                transferred: self.transferred,
                ..Default::default()
            },
        }
    }
}

/// Lifecycle Orchestrator.
pub struct Deployer {
    manager: ConnectionManager,
    transfer: TransferEngine,
    executor: CommandExecutor,
    default_timeout: Option<Duration>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Deployer {
    /// Real SSH dialer, plus the process-wide pool when enabled.
    pub fn new(config: &RunnerConfig) -> Self {
        let mut manager = ConnectionManager::new(Arc::new(SshDialer), config.dial.clone());
        if config.pool.enabled {
            manager = manager.with_pool(ConnectionPool::global(&config.pool));
        }
        Self::with_manager(manager, config)
    }

    pub fn with_manager(manager: ConnectionManager, config: &RunnerConfig) -> Self {
        Self {
            manager,
            transfer: TransferEngine::new(config.transfer.clone()),
            executor: CommandExecutor::new(),
            default_timeout: config.command_timeout(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Close pooled sessions. Call once before the process exits.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.manager.pool() {
            pool.drain().await;
        }
    }

    /// Compare persisted state with new inputs. No network access.
    pub fn diff(previous: &DeployerState, args: &DeployerArgs) -> DiffResponse {
        diff::diff(previous, args)
    }

    /// Serialize lifecycle operations on one resource identity.
    async fn lock_identity(&self, id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn budget(&self, options: ReconcileOptions) -> Option<Duration> {
        options.timeout.or(self.default_timeout)
    }

    pub async fn create(
        &self,
        name: &str,
        args: DeployerArgs,
        options: ReconcileOptions,
    ) -> Result<DeployerState, DeployError> {
        let id = resource_id(name, &args.connection);
        let _guard = self.lock_identity(&id).await;
        let mut rec = Reconciliation::begin(
            Operation::Create,
            &id,
            ResourceState::Uncreated,
            self.budget(options),
        )?;

        args.validate().map_err(|e| rec.fail(Phase::Validate, e))?;
        let payload_hashes = args
            .payload_hashes()
            .map_err(|(key, e)| rec.fail(Phase::Validate, unreadable(key, e)))?;

        let mut state = DeployerState {
            id,
            status: ResourceState::Uncreated,
            args,
            payload_hashes,
            outputs: Outputs::default(),
        };
        if options.preview {
            log::info!("{}: preview only, nothing applied", state.id);
            return Ok(state);
        }

        let applied = self
            .apply(&mut rec, &state.args, state.args.create.as_ref())
            .await?;
        state.outputs = applied.into_outputs(None);
        state.status = rec.complete();
        Ok(state)
    }

    pub async fn update(
        &self,
        previous: &DeployerState,
        args: DeployerArgs,
        options: ReconcileOptions,
    ) -> Result<DeployerState, DeployError> {
        let _guard = self.lock_identity(&previous.id).await;
        let mut rec = Reconciliation::begin(
            Operation::Update,
            &previous.id,
            previous.status,
            self.budget(options),
        )?;

        if previous.args.connection != args.connection {
            return Err(rec.fail(Phase::Validate, ValidationError::ReplaceRequired));
        }
        args.validate().map_err(|e| rec.fail(Phase::Validate, e))?;
        let payload_hashes = args
            .payload_hashes()
            .map_err(|(key, e)| rec.fail(Phase::Validate, unreadable(key, e)))?;

        let mut state = DeployerState {
            id: previous.id.clone(),
            status: previous.status,
            args,
            payload_hashes,
            outputs: previous.outputs.clone(),
        };
        if options.preview {
            log::info!("{}: preview only, nothing applied", state.id);
            return Ok(state);
        }

        let applied = self
            .apply(&mut rec, &state.args, state.args.update.as_ref())
            .await?;
        state.outputs = applied.into_outputs(Some(&previous.outputs));
        state.status = rec.complete();
        Ok(state)
    }

    /// On failure the resource must be kept: the caller retries later.
    pub async fn delete(
        &self,
        state: &DeployerState,
        options: ReconcileOptions,
    ) -> Result<ResourceState, DeployError> {
        let _guard = self.lock_identity(&state.id).await;
        let mut rec = Reconciliation::begin(
            Operation::Delete,
            &state.id,
            state.status,
            self.budget(options),
        )?;
        state.args.validate().map_err(|e| rec.fail(Phase::Validate, e))?;

        if state.args.delete.is_none() && !state.args.remove_payload_on_delete {
            log::info!("{}: no delete command, nothing to run", state.id);
            return Ok(rec.complete());
        }

        let lease = rec
            .bounded(Phase::Connect, self.manager.acquire(&state.args.connection))
            .await?;
        let result = self.run_then_cleanup(&mut rec, lease.shared(), &state.args).await;
        finish(lease, &result).await;
        result?;
        Ok(rec.complete())
    }

    /// Connect, transfer, run. Shared by create and update.
    async fn apply(
        &self,
        rec: &mut Reconciliation,
        args: &DeployerArgs,
        command: Option<&CommandDefinition>,
    ) -> Result<Applied, DeployError> {
        let assets = args.transfer_set(command);
        let lease = rec
            .bounded(Phase::Connect, self.manager.acquire(&args.connection))
            .await?;
        let result = self
            .transfer_then_run(rec, lease.shared(), &assets, command, &args.environment)
            .await;
        finish(lease, &result).await;
        result
    }

    async fn transfer_then_run(
        &self,
        rec: &mut Reconciliation,
        session: &Arc<dyn RemoteSession>,
        assets: &[FileAsset],
        command: Option<&CommandDefinition>,
        environment: &BTreeMap<String, String>,
    ) -> Result<Applied, DeployError> {
        let report = rec
            .bounded(Phase::Transfer, self.transfer.transfer(session.as_ref(), assets))
            .await?;

        let command = match command {
            Some(command) => {
                let deadline = rec.remaining();
                let result = self
                    .executor
                    .run(session, command, environment, deadline)
                    .await
                    .map_err(|e| rec.fail(Phase::Execute, e))?;
                Some(result)
            }
            None => None,
        };

        Ok(Applied {
            transferred: report.succeeded,
            command,
        })
    }

    async fn run_then_cleanup(
        &self,
        rec: &mut Reconciliation,
        session: &Arc<dyn RemoteSession>,
        args: &DeployerArgs,
    ) -> Result<(), DeployError> {
        if let Some(command) = &args.delete {
            if !command.payload.is_empty() {
                let upload = self.transfer.transfer(session.as_ref(), &command.payload);
                rec.bounded(Phase::Transfer, upload).await?;
            }
            let deadline = rec.remaining();
            self.executor
                .run(session, command, &args.environment, deadline)
                .await
                .map_err(|e| rec.fail(Phase::Execute, e))?;
        }

        if args.remove_payload_on_delete {
            let paths = args.all_payload_paths();
            rec.bounded(Phase::Cleanup, self.transfer.remove(session.as_ref(), &paths))
                .await?;
        }
        Ok(())
    }
}

fn unreadable(key: String, err: std::io::Error) -> ValidationError {
    ValidationError::UnreadableAsset {
        key,
        reason: err.to_string(),
    }
}

/// Pool the session after success or an ordinary failure; drop it when
/// the failure leaves the session in doubt.
async fn finish<T>(lease: SessionLease, result: &Result<T, DeployError>) {
    match result {
        Err(e) if e.poisons_session() => lease.discard().await,
        _ => lease.release().await,
    }
}
