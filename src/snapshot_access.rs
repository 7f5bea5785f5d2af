//! Snapshot access (spec.md §4.E "Snapshot access").
//!
//! Array snapshots cannot be attached to a host directly; a temporary clone
//! stands in as a real, connectable volume for the duration of a read.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use log::warn;
use vol_api::error::OrchestratorError;
use vol_api::types::ArrayVolume;

use crate::{Orchestrator, TempCloneEntry, TempCloneKey};

/// Temp clones older than this are assumed to be orphans of a crashed
/// process (Design Notes "Global/process state", spec.md §3 Lifecycles).
const TEMP_CLONE_MAX_AGE_SECS: i64 = 3600;

impl Orchestrator {
    /// Provides read access to `(storage, volname, snap)` by cloning the
    /// snapshot into a real, connected volume and returning its local device
    /// path. The clone is tracked in-process so `deactivate_snapshot_access`
    /// can find it again.
    pub fn snapshot_access(&self, storage: &str, volname: &str, snap: &str) -> Result<String, OrchestratorError> {
        let array_base = naming::pve_to_array(storage, volname)?;
        let source = format!("{array_base}.{}", naming::encode_snapshot(snap));
        let full_source = self.qualify(&source);
        self.array
            .get_snapshot(&full_source)?
            .ok_or_else(|| OrchestratorError::Other(format!("snapshot '{full_source}' does not exist")))?;

        let target_name = format!("{array_base}-temp-snap-access-{}-{}", unix_timestamp(), std::process::id());
        let full_target = self.qualify(&target_name);

        let created = self.array.clone_volume(&full_source, &full_target)?;

        if let Err(e) = self.array.connect(&self.host_name(), &full_target) {
            let _ = self.array.eradicate_volume(&full_target);
            return Err(e.into());
        }

        let resolved = match self.wait_for_local_device(&created.serial) {
            Ok(resolved) => resolved,
            Err(e) => {
                let _ = self.array.eradicate_volume(&full_target);
                return Err(e);
            }
        };

        let key = TempCloneKey {
            storage: storage.to_owned(),
            volname: volname.to_owned(),
            snap: snap.to_owned(),
        };
        self.temp_clones
            .lock()
            .expect("temp_clones mutex poisoned")
            .insert(key, TempCloneEntry { array_name: full_target });

        Ok(resolved.path)
    }

    /// Tears down and eradicates the temp clone created by `snapshot_access`
    /// for the same triple, within this process.
    pub fn deactivate_snapshot_access(&self, storage: &str, volname: &str, snap: &str) -> Result<(), OrchestratorError> {
        let key = TempCloneKey {
            storage: storage.to_owned(),
            volname: volname.to_owned(),
            snap: snap.to_owned(),
        };
        let entry = self.temp_clones.lock().expect("temp_clones mutex poisoned").remove(&key);

        let Some(entry) = entry else {
            // Tracking is process-local by design; a clone created by a
            // different process for this triple is reaped by the next
            // activate_storage's orphan sweep instead.
            return Err(OrchestratorError::Other(format!(
                "no temp clone tracked in this process for '{volname}' snapshot '{snap}'"
            )));
        };

        if let Some(vol) = self.array.get_volume(&entry.array_name)? {
            self.teardown_and_eradicate(&vol)?;
        }
        Ok(())
    }

    /// Finds and eradicates temp clones older than one hour, left behind by
    /// a process that died mid-access. Runs at the start of every
    /// `activate_storage`.
    pub(crate) fn sweep_orphan_temp_clones(&self) -> Result<(), OrchestratorError> {
        let glob = self.qualify("*-temp-snap-access-*");
        let volumes = self.array.list_volumes(&glob)?;
        let now = Utc::now();

        for vol in volumes {
            if vol.destroyed {
                continue;
            }
            let age_secs = now.signed_duration_since(vol.created).num_seconds();
            if age_secs < TEMP_CLONE_MAX_AGE_SECS {
                continue;
            }
            if let Err(e) = self.teardown_and_eradicate(&vol) {
                warn!("failed to sweep orphan temp clone '{}': {e}", vol.name);
            }
        }
        Ok(())
    }

    fn teardown_and_eradicate(&self, vol: &ArrayVolume) -> Result<(), OrchestratorError> {
        let wwid = vol_api::wwid::serial_to_wwid(&vol.serial);
        if let Some(resolved) = devresolver::lookup::resolve_wwid(&wwid)? {
            devresolver::teardown::teardown(&resolved)?;
        }
        for conn in self.array.list_connections(&vol.name)? {
            self.array.disconnect(&conn.host_name, &vol.name)?;
        }
        self.array.eradicate_volume(&vol.name)?;
        Ok(())
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

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

    #[test]
    fn deactivate_without_tracked_entry_is_an_error() {
        let mut server = Server::new();
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
        let orch = Orchestrator::for_testing(config, array, "node1");

        let result = orch.deactivate_snapshot_access("pure1", "vm-100-disk-0", "snap1");
        assert!(result.is_err());
    }

    #[test]
    fn temp_clone_key_equality_ignores_unrelated_fields() {
        let a = TempCloneKey {
            storage: "pure1".to_owned(),
            volname: "vm-100-disk-0".to_owned(),
            snap: "snap1".to_owned(),
        };
        let b = a.clone();
        let mut map = HashMap::new();
        map.insert(a, TempCloneEntry { array_name: "pve-pure1-100-temp-snap-access-1-2".to_owned() });
        assert!(map.contains_key(&b));
        let _ = Mutex::new(map);
    }
}
