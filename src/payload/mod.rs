//! Files materialized on the remote target.
//!
//! A payload is an ordered list of [`FileAsset`]s. Target paths must be
//! unique across everything transferred in one transition.

pub mod transfer;

use crate::crypto;
use crate::error::{TransferError, TransferErrorKind, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// One file to write remotely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAsset {
    /// Remote target path. Relative paths resolve against the login directory.
    pub filename: String,
    #[serde(flatten)]
    pub source: AssetSource,
    /// Permission bits; `None` leaves the remote umask in charge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Where the bytes come from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetSource {
    /// Inline text. May be empty.
    Contents(String),
    /// A file on the machine running the engine.
    LocalPath(String),
}

impl fmt::Debug for AssetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contents(c) => write!(f, "Contents({} bytes)", c.len()),
            Self::LocalPath(p) => f.debug_tuple("LocalPath").field(p).finish(),
        }
    }
}

impl FileAsset {
    pub fn from_contents(
        filename: impl Into<String>,
        contents: impl Into<String>,
        mode: Option<u32>,
    ) -> Self {
        Self {
            filename: filename.into(),
            source: AssetSource::Contents(contents.into()),
            mode,
        }
    }

    pub fn from_local_path(
        filename: impl Into<String>,
        local_path: impl Into<String>,
        mode: Option<u32>,
    ) -> Self {
        Self {
            filename: filename.into(),
            source: AssetSource::LocalPath(local_path.into()),
            mode,
        }
    }

    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidAsset {
            index,
            reason: reason.to_string(),
        };
        if self.filename.trim().is_empty() {
            return Err(invalid("filename must be set"));
        }
        if self.filename.contains('\0') {
            return Err(invalid("filename contains a NUL byte"));
        }
        if self.filename.ends_with('/') {
            return Err(invalid("filename names a directory"));
        }
        if let AssetSource::LocalPath(p) = &self.source {
            if p.trim().is_empty() {
                return Err(invalid("localPath must not be empty"));
            }
        }
        if let Some(mode) = self.mode {
            if mode > 0o7777 {
                return Err(invalid(&format!("mode {:o} is out of range", mode)));
            }
        }
        Ok(())
    }

    /// Bytes to write. Local files are read at transfer time.
    pub async fn load(&self) -> Result<Vec<u8>, TransferError> {
        match &self.source {
            AssetSource::Contents(c) => Ok(c.as_bytes().to_vec()),
            AssetSource::LocalPath(p) => tokio::fs::read(p).await.map_err(|e| {
                let kind = match e.kind() {
                    std::io::ErrorKind::NotFound => TransferErrorKind::PathInvalid,
                    std::io::ErrorKind::PermissionDenied => TransferErrorKind::PermissionDenied,
                    _ => TransferErrorKind::IoError,
                };
                TransferError::new(kind, &self.filename, format!("reading local {}: {}", p, e))
            }),
        }
    }

    /// SHA-256 of the content, hex encoded.
    pub fn hash(&self) -> Result<String, std::io::Error> {
        match &self.source {
            AssetSource::Contents(c) => Ok(crypto::sha256_hex(c.as_bytes())),
            AssetSource::LocalPath(p) => Ok(crypto::sha256_hex(&std::fs::read(p)?)),
        }
    }
}

/// Collapse repeated slashes and `.` segments so `a//b` and `./a/b` collide.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let joined = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect::<Vec<_>>()
        .join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Validate every asset and reject duplicate target paths across all the
/// given payload lists.
pub fn validate_payloads(payloads: &[&[FileAsset]]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for (index, asset) in payloads.iter().flat_map(|p| p.iter()).enumerate() {
        asset.validate(index)?;
        if !seen.insert(normalize_path(&asset.filename)) {
            return Err(ValidationError::DuplicatePayloadPath(asset.filename.clone()));
        }
    }
    Ok(())
}

/// Content hashes keyed by `<scope>[<filename>]`, e.g. `payload[app.conf]`
/// or `create.payload[run.sh]`.
pub fn payload_hashes(
    scoped: &[(&str, &[FileAsset])],
) -> Result<BTreeMap<String, String>, (String, std::io::Error)> {
    let mut hashes = BTreeMap::new();
    for (scope, assets) in scoped {
        for asset in assets.iter() {
            let key = format!("{}[{}]", scope, asset.filename);
            let hash = asset.hash().map_err(|e| (key.clone(), e))?;
            hashes.insert(key, hash);
        }
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_json_shape() {
        let json = r#"{"filename":"/etc/app/conf","contents":"x=1","mode":420}"#;
        let asset: FileAsset = serde_json::from_str(json).unwrap();
        assert_eq!(asset, FileAsset::from_contents("/etc/app/conf", "x=1", Some(0o644)));

        let json = r#"{"filename":"deploy.sh","localPath":"/tmp/deploy.sh"}"#;
        let local: FileAsset = serde_json::from_str(json).unwrap();
        assert_eq!(local.source, AssetSource::LocalPath("/tmp/deploy.sh".into()));
        assert_eq!(local.mode, None);
    }

    #[test]
    fn test_validate_rejects_bad_assets() {
        assert!(FileAsset::from_contents("", "x", None).validate(0).is_err());
        assert!(FileAsset::from_contents("/etc/", "x", None).validate(0).is_err());
        assert!(FileAsset::from_contents("/etc/a", "x", Some(0o17777)).validate(0).is_err());
        assert!(FileAsset::from_local_path("/etc/a", " ", None).validate(0).is_err());
        // Empty contents are a legitimate empty file.
        assert!(FileAsset::from_contents("/etc/a", "", None).validate(0).is_ok());
    }

    #[test]
    fn test_duplicates_across_payloads_rejected() {
        let global = vec![FileAsset::from_contents("/srv/app.conf", "a", None)];
        let command = vec![FileAsset::from_contents("//srv/./app.conf", "b", None)];
        assert_eq!(
            validate_payloads(&[global.as_slice(), command.as_slice()]),
            Err(ValidationError::DuplicatePayloadPath("//srv/./app.conf".into()))
        );
        assert!(validate_payloads(&[global.as_slice()]).is_ok());
    }

    #[test]
    fn test_invalid_asset_reports_position() {
        let global = vec![FileAsset::from_contents("a", "a", None)];
        let command = vec![FileAsset::from_contents("  ", "b", None)];
        assert!(matches!(
            validate_payloads(&[global.as_slice(), command.as_slice()]),
            Err(ValidationError::InvalidAsset { index: 1, .. })
        ));
    }

    #[test]
    fn test_hash_local_file_matches_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.sh");
        std::fs::write(&path, "v1").unwrap();

        let local = FileAsset::from_local_path("deploy.sh", path.to_string_lossy(), None);
        let inline = FileAsset::from_contents("deploy.sh", "v1", None);
        assert_eq!(local.hash().unwrap(), inline.hash().unwrap());
    }

    #[test]
    fn test_payload_hashes_are_scoped() {
        let global = vec![FileAsset::from_contents("deploy.sh", "global", None)];
        let create = vec![FileAsset::from_contents("deploy.sh", "create", None)];
        let scopes = [("payload", global.as_slice()), ("create.payload", create.as_slice())];
        let hashes = payload_hashes(&scopes).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes["payload[deploy.sh]"], crypto::sha256_hex(b"global"));
        assert_eq!(hashes["create.payload[deploy.sh]"], crypto::sha256_hex(b"create"));
    }

    #[test]
    fn test_payload_hashes_missing_local_file() {
        let missing = vec![FileAsset::from_local_path("m.sh", "/nonexistent/m.sh", None)];
        let (key, _) = payload_hashes(&[("payload", missing.as_slice())]).unwrap_err();
        assert_eq!(key, "payload[m.sh]");
    }

    #[tokio::test]
    async fn test_load_missing_local_file_is_path_invalid() {
        let asset = FileAsset::from_local_path("/srv/x", "/nonexistent/x", None);
        let err = asset.load().await.unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::PathInvalid);
        assert_eq!(err.path, "/srv/x");
    }
}
