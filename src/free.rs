//! Free (spec.md §4.E "Free").

use log::warn;
use vol_api::error::OrchestratorError;

use crate::Orchestrator;

impl Orchestrator {
    /// Tears down the local device (if any), disconnects every host, and
    /// soft-deletes the volume backing `host_volname`. Absent-already is
    /// success, not an error (spec.md §3 "Lifecycles" idempotence).
    ///
    /// If this was the last `disk*` volume left for the VMID, its config
    /// backups are swept too: nothing else will ever reference them once the
    /// VM itself is gone from this storage.
    pub fn free(&self, storage: &str, host_volname: &str) -> Result<(), OrchestratorError> {
        let parsed = naming::parse_host_volname(host_volname)?;
        let array_base = naming::pve_to_array(storage, host_volname)?;
        let full_name = self.qualify(&array_base);

        let vol = match self.array.get_volume(&full_name)? {
            Some(vol) if !vol.destroyed => vol,
            _ => {
                warn!("free_image on absent or already-destroyed volume '{full_name}'");
                return Ok(());
            }
        };

        let wwid = vol_api::wwid::serial_to_wwid(&vol.serial);
        if let Some(resolved) = devresolver::lookup::resolve_wwid(&wwid)? {
            devresolver::teardown::teardown(&resolved)?;
        }

        for conn in self.array.list_connections(&full_name)? {
            self.array.disconnect(&conn.host_name, &full_name)?;
        }

        self.array.destroy_volume(&full_name)?;

        let vmid = parsed.vmid();
        if self.is_last_disk_for_vmid(storage, vmid)? {
            if let Err(e) = self.delete_all_config_backups(storage, vmid) {
                warn!("failed to sweep config backups for vmid {vmid} on '{storage}': {e}");
            }
        }

        Ok(())
    }

    fn is_last_disk_for_vmid(&self, storage: &str, vmid: u32) -> Result<bool, OrchestratorError> {
        let glob = self.qualify(&format!("{}-*", naming::array_prefix(storage, vmid)));
        let existing = self.array.list_volumes(&glob)?;
        let any_disk_left = existing.iter().any(|vol| {
            if vol.destroyed {
                return false;
            }
            let (_, local) = naming::unqualify_pod(&vol.name);
            matches!(
                naming::decode_volume(local).map(|d| d.role),
                Some(naming::ArrayRole::Disk(_))
            )
        });
        Ok(!any_disk_left)
    }
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
    fn free_on_absent_volume_is_idempotent_success() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes.*".into()))
            .with_status(404)
            .with_body(r#"{"errors":[{"message":"not found"}]}"#)
            .create();

        let result = orch.free("pure1", "vm-100-disk-0");
        assert!(result.is_ok());
    }

    #[test]
    fn is_last_disk_for_vmid_false_when_sibling_disk_remains() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?filter=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[{"name":"pve-pure1-100-disk1","provisioned":1073741824,"space":{"total_physical":0},"serial":"AAAAAAAAAAAAAAAAAAAAAAAA","destroyed":false,"created":1700000000000}]}"#,
            )
            .create();

        let last = orch.is_last_disk_for_vmid("pure1", 100).unwrap();
        assert!(!last);
    }

    #[test]
    fn is_last_disk_for_vmid_true_when_nothing_left() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?filter=.*".into()))
            .with_status(200)
            .with_body(r#"{"items":[]}"#)
            .create();

        let last = orch.is_last_disk_for_vmid("pure1", 100).unwrap();
        assert!(last);
    }
}
