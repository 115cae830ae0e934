//! Payload transfer: writes assets to the remote in order and reports the
//! outcome per file.

use super::{normalize_path, FileAsset};
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferErrorKind};
use crate::ssh::RemoteSession;
use std::collections::HashSet;
use thiserror::Error;

/// Per-file outcome of one transfer or cleanup pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<TransferError>,
}

impl TransferReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// A transfer that did not complete; `error` is the first failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{error} ({} of {} files written)", .report.succeeded.len(), .total)]
pub struct TransferFailure {
    pub error: TransferError,
    pub report: TransferReport,
    pub total: usize,
}

pub struct TransferEngine {
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Write every asset, creating parent directories as needed.
    ///
    /// Stops at the first failure unless `continue_on_error` is set; either
    /// way any failure makes the whole transfer an error. Writing the same
    /// assets twice leaves the remote unchanged.
    pub async fn transfer(
        &self,
        session: &dyn RemoteSession,
        assets: &[FileAsset],
    ) -> Result<TransferReport, TransferFailure> {
        let mut report = TransferReport::default();
        let total = assets.len();

        let mut seen = HashSet::new();
        for asset in assets {
            if !seen.insert(normalize_path(&asset.filename)) {
                let error = TransferError::new(
                    TransferErrorKind::DuplicatePath,
                    &asset.filename,
                    "path appears more than once in the payload",
                );
                return Err(TransferFailure { error, report, total });
            }
        }

        for asset in assets {
            match self.transfer_one(session, asset).await {
                Ok(()) => {
                    log::info!("Transferred {}", asset.filename);
                    report.succeeded.push(asset.filename.clone());
                }
                Err(e) => {
                    log::error!("Transfer of {} failed: {}", asset.filename, e);
                    report.failed.push(e);
                    if !self.config.continue_on_error {
                        break;
                    }
                }
            }
        }

        match report.failed.first().cloned() {
            None => Ok(report),
            Some(error) => Err(TransferFailure { error, report, total }),
        }
    }

    async fn transfer_one(
        &self,
        session: &dyn RemoteSession,
        asset: &FileAsset,
    ) -> Result<(), TransferError> {
        let contents = asset.load().await?;
        if let Some(parent) = parent_dir(&asset.filename) {
            session.create_dir_all(&parent).await?;
        }
        session.write_file(&asset.filename, &contents, asset.mode).await
    }

    /// Remove previously transferred files. Files already gone count as
    /// removed; every path is attempted.
    pub async fn remove(
        &self,
        session: &dyn RemoteSession,
        paths: &[String],
    ) -> Result<TransferReport, TransferFailure> {
        let mut report = TransferReport::default();
        for path in paths {
            match session.remove_file(path).await {
                Ok(()) => report.succeeded.push(path.clone()),
                Err(e) if e.kind == TransferErrorKind::PathInvalid => {
                    log::debug!("{} already absent", path);
                    report.succeeded.push(path.clone());
                }
                Err(e) => {
                    log::warn!("Could not remove {}: {}", path, e);
                    report.failed.push(e);
                }
            }
        }
        match report.failed.first().cloned() {
            None => Ok(report),
            Some(error) => Err(TransferFailure {
                error,
                report,
                total: paths.len(),
            }),
        }
    }
}

fn parent_dir(path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    let (parent, _) = normalized.rsplit_once('/')?;
    if parent.is_empty() {
        None
    } else {
        Some(parent.to_string())
    }
}
