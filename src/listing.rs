//! Listing and status (spec.md §4.E "Listing" and "Status").

use naming::ArrayRole;
use vol_api::error::OrchestratorError;
use vol_api::types::Capacity;

use crate::Orchestrator;

/// One entry in a storage's image listing, as the host platform's content
/// browser expects it.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub host_volname: String,
    pub vmid: u32,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub is_template: bool,
}

impl Orchestrator {
    /// Lists every live (non-destroyed) disk, cloudinit, and state volume
    /// under `storage`. Config-backup volumes never surface here
    /// (`naming::array_to_pve` has no host-visible form for them).
    ///
    /// A volume counts as a template iff it carries a `pve-base` marker
    /// snapshot. Linked-clone parentage is not reconstructed here: the array
    /// itself forgets a clone's lineage once taken, so a clone of a template
    /// lists as a plain disk, same as the host platform's own content
    /// browser would show it.
    pub fn list_images(&self, storage: &str) -> Result<Vec<ImageInfo>, OrchestratorError> {
        let glob = self.qualify(&format!("{}-*", naming::storage_prefix(storage)));
        let volumes = self.array.list_volumes(&glob)?;
        let snapshots = self.array.list_snapshots(&glob)?;

        let templates: std::collections::HashSet<&str> = snapshots
            .iter()
            .filter(|snap| snap.is_template_marker())
            .map(|snap| snap.source_volume.as_str())
            .collect();

        let mut images = Vec::new();
        for vol in &volumes {
            if vol.destroyed {
                continue;
            }
            let (_, local) = naming::unqualify_pod(&vol.name);
            let Some(decoded) = naming::decode_volume(local) else {
                continue;
            };
            if decoded.storage != storage {
                continue;
            }
            let is_template = templates.contains(vol.name.as_str());
            let Some(host_volname) = naming::array_to_pve(&decoded, is_template, None) else {
                continue;
            };

            images.push(ImageInfo {
                host_volname,
                vmid: decoded.vmid,
                size_bytes: vol.provisioned_bytes,
                used_bytes: vol.used_bytes,
                is_template,
            });
        }

        Ok(images)
    }

    /// Reports capacity for `storage`: the configured pod's quota when one
    /// is set, otherwise the array's own totals (spec.md §4.E "Status").
    pub fn status(&self, _storage: &str) -> Result<Capacity, OrchestratorError> {
        match &self.config.pod {
            Some(pod) => Ok(self.array.pod_info(pod)?),
            None => Ok(self.array.array_info()?),
        }
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
    fn list_images_marks_template_and_skips_vmconf() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?filter=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[
                    {"name":"pve-pure1-100-disk0","provisioned":1073741824,"volumes":0,"serial":"AAAAAAAAAAAAAAAAAAAAAAAA","destroyed":false,"created":1700000000000},
                    {"name":"pve-pure1-200-disk0","provisioned":2147483648,"volumes":0,"serial":"BBBBBBBBBBBBBBBBBBBBBBBB","destroyed":false,"created":1700000000000},
                    {"name":"pve-pure1-100-vmconf-snap1","provisioned":1048576,"volumes":0,"serial":"CCCCCCCCCCCCCCCCCCCCCCCC","destroyed":false,"created":1700000000000}
                ]}"#,
            )
            .create();
        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volume-snapshots\?filter=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[{"name":"pve-pure1-200-disk0.pve-base","source":"pve-pure1-200-disk0","created":1700000000000,"destroyed":false}]}"#,
            )
            .create();

        let images = orch.list_images("pure1").unwrap();
        assert_eq!(images.len(), 2);

        let base = images.iter().find(|i| i.vmid == 200).unwrap();
        assert!(base.is_template);
        assert_eq!(base.host_volname, "base-200-disk-0");

        let plain = images.iter().find(|i| i.vmid == 100).unwrap();
        assert!(!plain.is_template);
        assert_eq!(plain.host_volname, "vm-100-disk-0");
    }

    #[test]
    fn status_uses_array_totals_without_a_pod() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", "/api/2.x/arrays/space")
            .with_status(200)
            .with_body(r#"{"items":[{"capacity":107374182400,"total_physical":53687091200}]}"#)
            .create();

        let capacity = orch.status("pure1").unwrap();
        assert_eq!(capacity.total_bytes, 107374182400);
        assert_eq!(capacity.used_bytes, 53687091200);
    }
}
