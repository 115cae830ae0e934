//! Lifecycle commands and their execution over a session.
//!
//! The command text runs under `sh` in its own process group with the merged
//! environment exported in front of it. stdout and stderr are captured
//! separately and decoded as lossy UTF-8. When a deadline elapses the whole
//! remote process group is killed and the run reports
//! [`CommandError::TimedOut`].

use crate::crypto;
use crate::error::{CommandError, ValidationError};
use crate::payload::FileAsset;
use crate::ssh::RemoteSession;
use serde::{Deserialize, Serialize};
use shell_escape::unix::escape;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// How long the kill request itself may take after a timeout.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Exit status of the kill script when no pidfile exists.
const NO_PID_FILE: u32 = 3;

/// A create, update or delete command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDefinition {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Merged over the resource environment; wins on conflicts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Extra files transferred only for this transition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<FileAsset>,
}

impl CommandDefinition {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<FileAsset>) -> Self {
        self.payload = payload;
        self
    }

    pub fn validate(&self, transition: &'static str) -> Result<(), ValidationError> {
        if self.command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand(transition));
        }
        validate_environment(&self.environment)
    }
}

/// Captured remote output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr when there is any, otherwise stdout; trimmed.
    pub fn summary(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// A command that exited 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub output: CommandOutput,
}

/// Environment names must be portable shell identifiers.
pub fn validate_environment(env: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for name in env.keys() {
        let mut chars = name.chars();
        let valid = matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
            && chars.all(|c| c == '_' || c.is_ascii_alphanumeric());
        if !valid {
            return Err(ValidationError::InvalidEnvName(name.clone()));
        }
    }
    Ok(())
}

/// `overlay` wins over `base`.
pub fn merge_environment(
    base: &BTreeMap<String, String>,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Exports, optional `cd`, then the command text.
pub fn render_script(
    definition: &CommandDefinition,
    environment: &BTreeMap<String, String>,
) -> String {
    let mut script = String::new();
    for (name, value) in environment {
        script.push_str(&format!("export {}={}\n", name, escape(value.as_str().into())));
    }
    if let Some(dir) = &definition.working_dir {
        script.push_str(&format!("cd {} || exit 1\n", escape(dir.as_str().into())));
    }
    script.push_str(&definition.command);
    script.push('\n');
    script
}

fn pid_file(run_id: &str) -> String {
    format!("/tmp/.runner-{}.pid", run_id)
}

/// Run `script` as the leader of a fresh process group (via `setsid` where
/// available) and record its pid so a timeout can kill the whole group.
fn wrap_in_process_group(script: &str, run_id: &str) -> String {
    let pid_file = pid_file(run_id);
    let inner = format!("echo $$ > {}\n{}", pid_file, script);
    let quoted = escape(inner.into());
    format!(
        "if command -v setsid >/dev/null 2>&1; then setsid sh -c {q}; else sh -c {q}; fi\n\
         rc=$?\n\
         rm -f {p}\n\
         exit $rc\n",
        q = quoted,
        p = pid_file
    )
}

/// Exits 3 when the pidfile is not there (yet).
fn kill_script(run_id: &str) -> String {
    format!(
        "pid=$(cat {p} 2>/dev/null) || exit {code}; \
         kill -KILL -- -\"$pid\" 2>/dev/null || kill -KILL \"$pid\"; rm -f {p}",
        p = pid_file(run_id),
        code = NO_PID_FILE
    )
}

/// Kill the process group of `run_id`. The pidfile is written by the remote
/// shell as its first step, so a kill that races process start is retried
/// once.
async fn terminate(session: &dyn RemoteSession, run_id: &str) {
    for attempt in 1..=2 {
        match tokio::time::timeout(KILL_TIMEOUT, session.exec(&kill_script(run_id))).await {
            Ok(Ok(out)) if out.exit_status == Some(NO_PID_FILE) && attempt == 1 => {
                log::debug!("No pidfile for command {} yet, retrying kill", run_id);
                tokio::time::sleep(KILL_RETRY_DELAY).await;
            }
            Ok(Ok(_)) => return,
            Ok(Err(e)) => {
                log::warn!("Could not kill command {}: {}", run_id, e);
                return;
            }
            Err(_) => {
                log::warn!("Kill request for command {} timed out", run_id);
                return;
            }
        }
    }
}

/// Kills the remote process group when a run is abandoned mid-exec
/// (caller timeout, task abort). Takes over closing the session so the kill
/// is not raced by a disconnect.
struct KillOnDrop {
    session: Option<Arc<dyn RemoteSession>>,
    run_id: String,
}

impl KillOnDrop {
    fn arm(session: &Arc<dyn RemoteSession>, run_id: &str) -> Self {
        Self {
            session: Some(session.clone()),
            run_id: run_id.to_string(),
        }
    }

    fn disarm(mut self) {
        self.session = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let run_id = std::mem::take(&mut self.run_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Command {} abandoned, killing process group", run_id);
                handle.spawn(async move {
                    terminate(session.as_ref(), &run_id).await;
                    session.close().await;
                });
            }
            Err(_) => log::warn!("Command {} abandoned outside a runtime; not killed", run_id),
        }
    }
}

#[derive(Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run `definition` with its environment merged over `environment`.
    ///
    /// No deadline means no timeout. A non-zero exit is
    /// [`CommandError::Failed`] with the captured output attached. Dropping
    /// the returned future while the command runs kills it remotely.
    pub async fn run(
        &self,
        session: &Arc<dyn RemoteSession>,
        definition: &CommandDefinition,
        environment: &BTreeMap<String, String>,
        deadline: Option<Duration>,
    ) -> Result<CommandResult, CommandError> {
        let env = merge_environment(environment, &definition.environment);
        let run_id = crypto::random_id();
        let script = wrap_in_process_group(&render_script(definition, &env), &run_id);
        log::info!("Running command {} ({} env vars)", run_id, env.len());

        let guard = KillOnDrop::arm(session, &run_id);
        let finished = match deadline {
            None => Some(session.exec(&script).await),
            Some(limit) => tokio::time::timeout(limit, session.exec(&script)).await.ok(),
        };
        guard.disarm();

        let exec = match finished {
            Some(result) => result?,
            None => {
                let after = deadline.unwrap_or_default();
                log::warn!("Command {} exceeded {:?}, killing process group", run_id, after);
                terminate(session.as_ref(), &run_id).await;
                return Err(CommandError::TimedOut { after });
            }
        };

        let output = CommandOutput {
            stdout: exec.stdout,
            stderr: exec.stderr,
        };
        // Killed by a signal: no exit status.
        let exit_code = exec.exit_status.map(|s| s as i32).unwrap_or(-1);
        log::info!("Command {} exited with status {}", run_id, exit_code);
        if exit_code == 0 {
            Ok(CommandResult { exit_code, output })
        } else {
            Err(CommandError::Failed { exit_code, output })
        }
    }
}
