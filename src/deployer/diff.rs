//! Change detection between persisted state and new inputs.
//!
//! Never touches the network. Local payload files are read only to hash
//! them, so an edited `localPath` file shows up as a change even when the
//! declared inputs are identical.

use super::{DeployerArgs, DeployerState};
use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResponse {
    pub has_changes: bool,
    /// Only a connection change forces replacement; everything else is
    /// handled by update.
    pub requires_replace: bool,
    /// Changed input keys, e.g. `environment` or `payloadHashes.payload[a.conf]`.
    pub changed: Vec<String>,
}

/// True iff moving from `old` to `new` needs delete + create.
pub fn requires_replace(old: &DeployerArgs, new: &DeployerArgs) -> bool {
    old.connection != new.connection
}

pub fn diff(previous: &DeployerState, new: &DeployerArgs) -> DiffResponse {
    let old = &previous.args;
    let mut changed = Vec::new();
    let mut check = |key: &str, differs: bool| {
        if differs {
            changed.push(key.to_string());
        }
    };
    check("connection", old.connection != new.connection);
    check("environment", old.environment != new.environment);
    check("payload", old.payload != new.payload);
    check("create", old.create != new.create);
    check("update", old.update != new.update);
    check("delete", old.delete != new.delete);
    check(
        "removePayloadOnDelete",
        old.remove_payload_on_delete != new.remove_payload_on_delete,
    );

    match new.payload_hashes() {
        Ok(hashes) => {
            for (key, hash) in &hashes {
                if previous.payload_hashes.get(key) != Some(hash) {
                    changed.push(format!("payloadHashes.{}", key));
                }
            }
            for key in previous.payload_hashes.keys() {
                if !hashes.contains_key(key) {
                    changed.push(format!("payloadHashes.{}", key));
                }
            }
        }
        Err((key, e)) => {
            // Unreadable now; the update will fail validation, so surface it.
            log::warn!("Cannot hash {} for diff: {}", key, e);
            changed.push("payloadHashes".to_string());
        }
    }

    DiffResponse {
        has_changes: !changed.is_empty(),
        requires_replace: requires_replace(old, new),
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandDefinition;
    use crate::deployer::{resource_id, Outputs, ResourceState};
    use crate::payload::FileAsset;
    use crate::ssh::{Connection, SshAuth};

    fn args() -> DeployerArgs {
        let connection = Connection::new("h", "u", SshAuth::Password("pw".into()));
        let mut args = DeployerArgs::new(connection);
        args.payload = vec![FileAsset::from_contents("/etc/app/conf", "x=1", None)];
        args.create = Some(CommandDefinition::new("systemctl restart app"));
        args
    }

    fn state(args: DeployerArgs) -> DeployerState {
        DeployerState {
            id: resource_id("app", &args.connection),
            status: ResourceState::Created,
            payload_hashes: args.payload_hashes().unwrap(),
            args,
            outputs: Outputs::default(),
        }
    }

    #[test]
    fn test_identical_inputs_have_no_changes() {
        let previous = state(args());
        assert_eq!(diff(&previous, &args()), DiffResponse::default());
    }

    #[test]
    fn test_content_change_is_update_not_replace() {
        let previous = state(args());
        let mut new = args();
        new.payload = vec![FileAsset::from_contents("/etc/app/conf", "x=2", None)];

        let d = diff(&previous, &new);
        assert!(d.has_changes);
        assert!(!d.requires_replace);
        assert_eq!(d.changed, vec!["payload", "payloadHashes.payload[/etc/app/conf]"]);
    }

    #[test]
    fn test_connection_change_requires_replace() {
        let previous = state(args());
        let mut new = args();
        new.connection.port = 2222;

        let d = diff(&previous, &new);
        assert!(d.requires_replace);
        assert_eq!(d.changed, vec!["connection"]);
    }

    #[test]
    fn test_edited_local_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("deploy.sh");
        std::fs::write(&local, "v1").unwrap();

        let mut a = args();
        let asset = FileAsset::from_local_path("/opt/deploy.sh", local.to_string_lossy(), None);
        a.payload = vec![asset];
        let previous = state(a.clone());
        assert!(!diff(&previous, &a).has_changes);

        std::fs::write(&local, "v2").unwrap();
        let d = diff(&previous, &a);
        assert_eq!(d.changed, vec!["payloadHashes.payload[/opt/deploy.sh]"]);
        assert!(!d.requires_replace);
    }

    #[test]
    fn test_missing_stored_hashes_count_as_change() {
        let mut previous = state(args());
        previous.payload_hashes.clear();
        let d = diff(&previous, &args());
        assert_eq!(d.changed, vec!["payloadHashes.payload[/etc/app/conf]"]);
    }

    #[test]
    fn test_removed_command_payload_is_reported() {
        let mut a = args();
        a.delete = Some(
            CommandDefinition::new("sh /tmp/down.sh")
                .with_payload(vec![FileAsset::from_contents("/tmp/down.sh", "true", None)]),
        );
        let previous = state(a);

        let d = diff(&previous, &args());
        assert_eq!(d.changed, vec!["delete", "payloadHashes.delete.payload[/tmp/down.sh]"]);
    }

    #[test]
    fn test_unreadable_local_file_reports_hashes() {
        let previous = state(args());
        let mut new = args();
        let missing = FileAsset::from_local_path("/etc/app/conf", "/nonexistent/conf", None);
        new.payload = vec![missing];
        let d = diff(&previous, &new);
        assert_eq!(d.changed, vec!["payload", "payloadHashes"]);
    }

    #[test]
    fn test_non_connection_changes_never_require_replace() {
        let previous = state(args());
        let edits: [(&str, fn(&mut DeployerArgs)); 5] = [
            ("environment", |a| {
                a.environment.insert("MODE".into(), "prod".into());
            }),
            ("create", |a| a.create = Some(CommandDefinition::new("systemctl start app"))),
            ("update", |a| a.update = Some(CommandDefinition::new("systemctl reload app"))),
            ("delete", |a| a.delete = Some(CommandDefinition::new("systemctl stop app"))),
            ("removePayloadOnDelete", |a| a.remove_payload_on_delete = true),
        ];

        for (key, edit) in &edits {
            let mut new = args();
            edit(&mut new);
            let d = diff(&previous, &new);
            assert!(d.has_changes, "{key}");
            assert!(!d.requires_replace, "{key}");
            assert_eq!(d.changed, vec![key.to_string()]);
        }

        let mut all = args();
        all.payload = vec![FileAsset::from_contents("/etc/app/conf", "x=9", None)];
        for (_, edit) in &edits {
            edit(&mut all);
        }
        let d = diff(&previous, &all);
        assert!(d.has_changes);
        assert!(!d.requires_replace);
        assert_eq!(d.changed.len(), edits.len() + 2);

        all.connection.user = "root".into();
        assert!(diff(&previous, &all).requires_replace);
    }
}
