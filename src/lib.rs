//! Runner Core: reconciles SSH deployer resources
//!
//! Connects to a remote host, materializes payload files over SFTP and runs
//! lifecycle commands, driven by a declarative harness through
//! create, update, delete and diff.

pub mod command;
pub mod config;
pub mod crypto;
pub mod deployer;
pub mod error;
pub mod payload;
pub mod ssh;

pub use deployer::{Deployer, DeployerArgs, DeployerState, ReconcileOptions};
pub use error::DeployError;
