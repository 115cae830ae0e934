use crate::crypto;
use crate::error::{TransferError, TransferErrorKind};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use async_trait::async_trait;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tokio::io::AsyncWriteExt;

/// SFTP operations used by payload transfer.
pub struct SftpClient {
    session: SftpSession,
}

impl SftpClient {
    /// Start the SFTP subsystem on an already-open session channel.
    pub async fn init(channel: russh::Channel<russh::client::Msg>) -> Result<Self, TransferError> {
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| io_error("", format!("sftp subsystem: {}", e)))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| map_sftp_error("", e))?;
        Ok(Self { session })
    }

    /// Create `path` and any missing parents.
    pub async fn create_dir_all(&self, path: &str) -> Result<(), TransferError> {
        for dir in ancestors(path) {
            let exists = self
                .session
                .try_exists(dir.as_str())
                .await
                .map_err(|e| map_sftp_error(&dir, e))?;
            if exists {
                continue;
            }
            if let Err(e) = self.session.create_dir(dir.as_str()).await {
                // Lost a race with another writer; fine if it is there now.
                let created = self.session.try_exists(dir.as_str()).await.unwrap_or(false);
                if !created {
                    return Err(map_sftp_error(&dir, e));
                }
            }
        }
        Ok(())
    }

    /// Write to a temporary sibling, set the mode, then rename into place,
    /// so readers never observe a half-written file.
    pub async fn write_atomic(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), TransferError> {
        let tmp = format!("{}.runner-{}", path, crypto::random_id());

        let mut file = self
            .session
            .create(tmp.as_str())
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        let written: std::io::Result<()> = async {
            file.write_all(contents).await?;
            file.shutdown().await
        }
        .await;
        if let Err(e) = written {
            let _ = self.session.remove_file(tmp.as_str()).await;
            return Err(io_error(path, e.to_string()));
        }

        if let Some(mode) = mode {
            let attrs = FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            };
            if let Err(e) = self.session.set_metadata(tmp.as_str(), attrs).await {
                let _ = self.session.remove_file(tmp.as_str()).await;
                return Err(map_sftp_error(path, e));
            }
        }

        replace(&self.session, &tmp, path).await?;

        log::debug!("Wrote {} ({} bytes)", path, contents.len());
        Ok(())
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        self.session
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }
}

/// The three calls [`replace`] needs, kept apart so the fallback can be
/// exercised without a server.
#[async_trait]
trait RenameTarget: Send + Sync {
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransferError>;
    async fn exists(&self, path: &str) -> bool;
    async fn remove(&self, path: &str) -> Result<(), TransferError>;
}

#[async_trait]
impl RenameTarget for SftpSession {
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransferError> {
        SftpSession::rename(self, from, to)
            .await
            .map_err(|e| map_sftp_error(to, e))
    }

    async fn exists(&self, path: &str) -> bool {
        self.try_exists(path).await.unwrap_or(false)
    }

    async fn remove(&self, path: &str) -> Result<(), TransferError> {
        self.remove_file(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }
}

/// Move `tmp` over `path`. SFTPv3 servers refuse to rename onto an existing
/// file with a generic failure; only then is the target removed and the
/// rename retried. Any other refusal leaves the target untouched.
async fn replace(fs: &dyn RenameTarget, tmp: &str, path: &str) -> Result<(), TransferError> {
    let first = match fs.rename(tmp, path).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if first.kind != TransferErrorKind::IoError || !fs.exists(path).await {
        let _ = fs.remove(tmp).await;
        return Err(first);
    }

    log::debug!("Rename onto {} refused, replacing existing file", path);
    match fs.remove(path).await {
        Ok(()) => {}
        Err(e) if e.kind == TransferErrorKind::PathInvalid => {}
        Err(e) => {
            let _ = fs.remove(tmp).await;
            return Err(e);
        }
    }
    if let Err(e) = fs.rename(tmp, path).await {
        let _ = fs.remove(tmp).await;
        return Err(e);
    }
    Ok(())
}

/// `/a/b/c` -> `/a`, `/a/b`, `/a/b/c`; relative paths stay relative.
fn ancestors(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut current = if path.starts_with('/') {
        String::from("/")
    } else {
        String::new()
    };
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        dirs.push(current.clone());
    }
    dirs
}

fn io_error(path: &str, message: String) -> TransferError {
    TransferError::new(TransferErrorKind::IoError, path, message)
}

fn map_sftp_error(path: &str, err: SftpError) -> TransferError {
    let kind = match &err {
        SftpError::Status(status) => {
            classify_status(&status.status_code, &status.error_message)
        }
        _ => TransferErrorKind::IoError,
    };
    TransferError::new(kind, path, err.to_string())
}

fn classify_status(code: &StatusCode, message: &str) -> TransferErrorKind {
    let lower = message.to_lowercase();
    match code {
        StatusCode::PermissionDenied => TransferErrorKind::PermissionDenied,
        StatusCode::NoSuchFile => TransferErrorKind::PathInvalid,
        _ if lower.contains("no space") || lower.contains("quota") => TransferErrorKind::DiskFull,
        _ => TransferErrorKind::IoError,
    }
}
