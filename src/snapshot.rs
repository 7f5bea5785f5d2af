//! Snapshot lifecycle: create, delete, rollback (spec.md §4.E).

use log::warn;
use vol_api::error::{ArrayError, OrchestratorError};

use crate::Orchestrator;

impl Orchestrator {
    /// Creates an array snapshot of `host_volname` tagged `snap`, plus a
    /// best-effort config backup when `vm_config` is supplied. A config
    /// backup failure is logged and swallowed: the snapshot itself has
    /// already succeeded by the time the backup runs (spec.md §4.E
    /// "Snapshot").
    pub fn snapshot(
        &self,
        storage: &str,
        vmid: u32,
        host_volname: &str,
        snap: &str,
        vm_config: Option<&[u8]>,
    ) -> Result<(), OrchestratorError> {
        let array_base = naming::pve_to_array(storage, host_volname)?;
        let full_name = self.qualify(&array_base);
        let suffix = naming::encode_snapshot(snap);
        let full_snap_name = format!("{full_name}.{suffix}");

        if self.array.get_snapshot(&full_snap_name)?.is_some() {
            return Err(OrchestratorError::Other(format!("snapshot '{full_snap_name}' already exists")));
        }

        self.array.create_snapshot(&full_name, &suffix)?;

        if let Some(contents) = vm_config {
            if let Err(e) = self.backup_vm_config(storage, vmid, snap, contents) {
                warn!("config backup for snapshot '{full_snap_name}' failed: {e}");
            }
        }

        Ok(())
    }

    /// Deletes the array snapshot tagged `snap`, and its config backup if
    /// one exists. Idempotent on an already-absent snapshot (`delete_snapshot`
    /// tolerates a 404); surfaces `SnapshotHasDependents` when the array
    /// refuses because a clone still depends on it.
    pub fn delete_snapshot(
        &self,
        storage: &str,
        vmid: u32,
        host_volname: &str,
        snap: &str,
    ) -> Result<(), OrchestratorError> {
        let array_base = naming::pve_to_array(storage, host_volname)?;
        let full_name = self.qualify(&array_base);
        let suffix = naming::encode_snapshot(snap);
        let full_snap_name = format!("{full_name}.{suffix}");

        if let Err(e) = self.array.delete_snapshot(&full_snap_name) {
            return Err(into_delete_error(&full_snap_name, e));
        }

        if let Err(e) = self.delete_config_backup(storage, vmid, snap) {
            warn!("failed to delete config backup for snapshot '{full_snap_name}': {e}");
        }

        Ok(())
    }

    /// Overwrites `host_volname`'s content from `snap` in place (spec.md
    /// §4.E "rollback"). Refuses if the volume's current device is in use.
    pub fn rollback(&self, storage: &str, host_volname: &str, snap: &str) -> Result<(), OrchestratorError> {
        let array_base = naming::pve_to_array(storage, host_volname)?;
        let full_name = self.qualify(&array_base);
        let suffix = naming::encode_snapshot(snap);
        let full_snap_name = format!("{full_name}.{suffix}");

        let vol = self
            .array
            .get_volume(&full_name)?
            .ok_or_else(|| OrchestratorError::Other(format!("volume '{full_name}' does not exist")))?;

        let wwid = vol_api::wwid::serial_to_wwid(&vol.serial);
        if let Some(resolved) = devresolver::lookup::resolve_wwid(&wwid)? {
            if devresolver::inuse::is_device_in_use(&resolved.path, &[])? {
                return Err(OrchestratorError::Device(vol_api::error::DeviceError::InUse {
                    device: resolved.path,
                    reason: "cannot roll back a volume whose device is currently in use".to_owned(),
                }));
            }
        }

        self.array.overwrite_volume_from_snapshot(&full_name, &full_snap_name)?;

        sanfabric::common::rescan_scsi_hosts().map_err(|e| OrchestratorError::Other(e.to_string()))?;
        sanfabric::common::multipath_reconfigure().map_err(|e| OrchestratorError::Other(e.to_string()))?;
        sanfabric::common::udev_trigger_and_settle().map_err(|e| OrchestratorError::Other(e.to_string()))?;

        Ok(())
    }
}

/// Maps a delete-snapshot conflict to `SnapshotHasDependents` when it
/// represents a clone still depending on this snapshot, preferring the
/// array's structured `code` over matching on its English message.
fn into_delete_error(full_snap_name: &str, err: ArrayError) -> OrchestratorError {
    match &err {
        ArrayError::Conflict { code: Some(code), .. } if code.to_ascii_lowercase().contains("depend") => {
            OrchestratorError::SnapshotHasDependents {
                snapshot: full_snap_name.to_owned(),
            }
        }
        ArrayError::Conflict { code: None, message, .. } if contains_dependent_marker(message) => {
            OrchestratorError::SnapshotHasDependents {
                snapshot: full_snap_name.to_owned(),
            }
        }
        _ => err.into(),
    }
}

fn contains_dependent_marker(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("has dependent") || lower.contains("depend")
}

#[cfg(test)]
mod tests {
    use arrayclient::ArrayClient;
    use mockito::Server;
    use vol_api::config::{Credentials, HostMode, PluginConfig, Protocol};

    use super::*;

    fn test_config(portal: &str) -> PluginConfig {
        PluginConfig {
            portal: portal.to_owned(),
            credentials: Credentials::ApiToken { api_token: "tok".to_owned() },
            ssl_verify: false,
            protocol: Protocol::Iscsi,
            host_mode: HostMode::PerNode,
            cluster_name: "pve".to_owned(),
            device_timeout_secs: 10,
            pod: None,
        }
    }

    fn logged_in_orchestrator(server: &mut Server) -> Orchestrator {
        server.mock("GET", "/api/api_version").with_status(404).create();
        server.mock("GET", "/api/2.x/array").with_status(401).create();
        server
            .mock("POST", "/api/2.x/login")
            .with_status(200)
            .with_header("x-auth-token", "sess-abc")
            .with_body("{}")
            .create();

        let config = test_config(&server.host_with_port());
        let array = ArrayClient::with_base_url(server.url(), &config).unwrap();
        Orchestrator::for_testing(config, array, "node1")
    }

    #[test]
    fn snapshot_already_exists_is_rejected() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volume-snapshots\?names=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[{"name":"pve-pure1-100-disk0.pve-snap-s1","source":"pve-pure1-100-disk0","created":1700000000000,"destroyed":false}]}"#,
            )
            .create();

        let result = orch.snapshot("pure1", 100, "vm-100-disk-0", "s1", None);
        assert!(result.is_err());
    }

    #[test]
    fn delete_snapshot_maps_dependent_conflict() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("PATCH", mockito::Matcher::Regex(r"^/api/2\.x/volume-snapshots\?names=.*".into()))
            .with_status(409)
            .with_body(r#"{"errors":[{"message":"snapshot is referenced","code":"ERR_HAS_DEPENDENTS"}]}"#)
            .create();

        let err = orch.delete_snapshot("pure1", 100, "vm-100-disk-0", "s1").unwrap_err();
        assert!(matches!(err, OrchestratorError::SnapshotHasDependents { .. }));
    }

    #[test]
    fn delete_snapshot_is_idempotent_when_absent() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("PATCH", mockito::Matcher::Regex(r"^/api/2\.x/volume-snapshots\?names=.*".into()))
            .with_status(404)
            .with_body(r#"{"errors":[{"message":"not found"}]}"#)
            .create();
        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?names=.*".into()))
            .with_status(404)
            .with_body(r#"{"errors":[{"message":"not found"}]}"#)
            .create();

        let result = orch.delete_snapshot("pure1", 100, "vm-100-disk-0", "s1");
        assert!(result.is_ok());
    }

    #[test]
    fn rollback_fails_when_volume_missing() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?names=.*".into()))
            .with_status(404)
            .with_body(r#"{"errors":[{"message":"not found"}]}"#)
            .create();

        let result = orch.rollback("pure1", "vm-100-disk-0", "s1");
        assert!(result.is_err());
    }
}
