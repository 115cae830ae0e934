//! Command-line entry point: one lifecycle operation per invocation.
//!
//! Reads a JSON request, reconciles, and prints the resulting state (or
//! diff) as JSON on stdout. Logs go to stderr via `RUST_LOG`.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use runner_core::config::RunnerConfig;
use runner_core::{Deployer, DeployerArgs, DeployerState, ReconcileOptions};

#[derive(Debug, Parser)]
#[command(
    name = "runner",
    about = "Reconcile SSH deployer resources: transfer files and run lifecycle commands",
    arg_required_else_help = true
)]
struct Cli {
    /// Engine settings (JSON). Defaults apply when omitted.
    #[arg(long, env = "RUNNER_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    operation: OperationCommand,
}

#[derive(Debug, Subcommand)]
enum OperationCommand {
    /// Create a resource from `name` and `args`.
    Create(RequestArgs),
    /// Update `previous` to `args`.
    Update(RequestArgs),
    /// Delete the resource recorded in `previous`.
    Delete(RequestArgs),
    /// Compare `previous` with `args` without connecting.
    Diff(RequestArgs),
}

#[derive(Debug, clap::Args)]
struct RequestArgs {
    /// JSON request file; `-` reads stdin.
    #[arg(long)]
    request: PathBuf,
    /// Validate and hash only; no remote I/O.
    #[arg(long)]
    preview: bool,
    /// Overall deadline in seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    args: Option<DeployerArgs>,
    #[serde(default)]
    previous: Option<DeployerState>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    id: String,
    status: runner_core::deployer::ResourceState,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("Error: {:#}", err);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => RunnerConfig::from_json_file(path)?,
        None => RunnerConfig::default(),
    };
    let deployer = Deployer::new(&config);
    let result = dispatch(&deployer, cli.operation).await;
    deployer.shutdown().await;
    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn dispatch(
    deployer: &Deployer,
    operation: OperationCommand,
) -> anyhow::Result<serde_json::Value> {
    match operation {
        OperationCommand::Create(req) => {
            let options = options(&req);
            let request = read_request(&req.request)?;
            let name = request.name.context("create needs \"name\"")?;
            let args = request.args.context("create needs \"args\"")?;
            let state = deployer.create(&name, args, options).await?;
            Ok(serde_json::to_value(state)?)
        }
        OperationCommand::Update(req) => {
            let options = options(&req);
            let request = read_request(&req.request)?;
            let previous = request.previous.context("update needs \"previous\"")?;
            let args = request.args.context("update needs \"args\"")?;
            let state = deployer.update(&previous, args, options).await?;
            Ok(serde_json::to_value(state)?)
        }
        OperationCommand::Delete(req) => {
            if req.preview {
                bail!("--preview is not supported for delete");
            }
            let options = options(&req);
            let request = read_request(&req.request)?;
            let previous = request.previous.context("delete needs \"previous\"")?;
            let status = deployer.delete(&previous, options).await?;
            Ok(serde_json::to_value(DeleteResponse {
                id: previous.id,
                status,
            })?)
        }
        OperationCommand::Diff(req) => {
            let request = read_request(&req.request)?;
            let previous = request.previous.context("diff needs \"previous\"")?;
            let args = request.args.context("diff needs \"args\"")?;
            Ok(serde_json::to_value(Deployer::diff(&previous, &args))?)
        }
    }
}

fn options(req: &RequestArgs) -> ReconcileOptions {
    ReconcileOptions {
        preview: req.preview,
        timeout: req.timeout.map(Duration::from_secs),
    }
}

fn read_request(path: &PathBuf) -> anyhow::Result<Request> {
    let raw = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading request from stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("parsing request {}", path.display()))
}
