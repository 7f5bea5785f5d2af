//! Clone and template (spec.md §4.E "Clone and template").
//!
//! A template is a plain volume marked by a fixed-suffix `pve-base`
//! snapshot; `naming::array_to_pve` and `naming::TEMPLATE_SNAPSHOT_SUFFIX`
//! already encode that convention, so no separate "is-template" flag needs
//! storing anywhere.

use vol_api::error::{DeviceError, OrchestratorError};
use vol_api::types::ParsedVolname;

use crate::Orchestrator;

impl Orchestrator {
    /// Marks `host_volname` as a template by ensuring its `pve-base`
    /// snapshot exists. Refuses if the volume's device is currently in use
    /// (the source must be quiesced before it becomes a clone parent).
    pub fn create_base(&self, storage: &str, host_volname: &str) -> Result<(), OrchestratorError> {
        let array_base = naming::pve_to_array(storage, host_volname)?;
        let full_name = self.qualify(&array_base);

        let vol = self
            .array
            .get_volume(&full_name)?
            .ok_or_else(|| OrchestratorError::Other(format!("volume '{full_name}' does not exist")))?;

        let wwid = vol_api::wwid::serial_to_wwid(&vol.serial);
        if let Some(resolved) = devresolver::lookup::resolve_wwid(&wwid)? {
            if devresolver::inuse::is_device_in_use(&resolved.path, &[])? {
                return Err(OrchestratorError::Device(DeviceError::InUse {
                    device: resolved.path,
                    reason: "cannot template a volume whose device is currently in use".to_owned(),
                }));
            }
        }

        let template_marker = format!("{full_name}.{}", naming::TEMPLATE_SNAPSHOT_SUFFIX);
        if self.array.get_snapshot(&template_marker)?.is_none() {
            self.array.create_snapshot(&full_name, naming::TEMPLATE_SNAPSHOT_SUFFIX)?;
        }
        Ok(())
    }

    /// Clones `source_volname` into a new disk for `target_vmid`. `snap`
    /// picks an explicit source snapshot; with `snap: None`, a `pve-base`
    /// template marker is preferred over the live volume when one exists
    /// (spec.md §4.E "Clone and template" source resolution order).
    ///
    /// Returns the new host-side volume name: a linked-clone
    /// `base-X-disk-M/vm-Y-disk-N` form when `source_volname` is itself a
    /// template, or a plain `vm-Y-disk-N` otherwise.
    pub fn clone_image(
        &self,
        storage: &str,
        source_volname: &str,
        target_vmid: u32,
        snap: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let source_array_base = naming::pve_to_array(storage, source_volname)?;
        let full_source_base = self.qualify(&source_array_base);

        let source_spec = match snap {
            Some(snap) => format!("{full_source_base}.{}", naming::encode_snapshot(snap)),
            None => {
                let template_marker = format!("{full_source_base}.{}", naming::TEMPLATE_SNAPSHOT_SUFFIX);
                if self.array.get_snapshot(&template_marker)?.is_some() {
                    template_marker
                } else {
                    full_source_base.clone()
                }
            }
        };

        let disk_id = self.next_free_disk_index(storage, target_vmid)?;
        let target_array_name = naming::encode_volume(storage, target_vmid, disk_id);
        let full_target = self.qualify(&target_array_name);

        self.array.clone_volume(&source_spec, &full_target)?;

        if let Err(e) = self.connect_to_cluster(&full_target) {
            let _ = self.array.destroy_volume(&full_target);
            return Err(e);
        }

        let host_volname = match naming::parse_host_volname(source_volname)? {
            ParsedVolname::Base { vmid: base_vmid, disk_id: base_disk_id } => {
                format!("base-{base_vmid}-disk-{base_disk_id}/vm-{target_vmid}-disk-{disk_id}")
            }
            _ => format!("vm-{target_vmid}-disk-{disk_id}"),
        };

        Ok(host_volname)
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
    fn create_base_is_idempotent_when_marker_already_exists() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?names=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[{"name":"pve-pure1-100-disk0","provisioned":1073741824,"serial":"AAAAAAAAAAAAAAAAAAAAAAAA","destroyed":false,"created":1700000000000}]}"#,
            )
            .create();
        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volume-snapshots\?names=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[{"name":"pve-pure1-100-disk0.pve-base","source":"pve-pure1-100-disk0","created":1700000000000,"destroyed":false}]}"#,
            )
            .create();

        let result = orch.create_base("pure1", "base-100-disk-0");
        assert!(result.is_ok());
    }

    #[test]
    fn clone_image_prefers_template_marker_over_live_source() {
        let mut server = Server::new();
        let orch = logged_in_orchestrator(&mut server);

        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volume-snapshots\?names=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[{"name":"pve-pure1-100-disk0.pve-base","source":"pve-pure1-100-disk0","created":1700000000000,"destroyed":false}]}"#,
            )
            .create();
        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?filter=.*".into()))
            .with_status(200)
            .with_body(r#"{"items":[]}"#)
            .create();
        let clone_mock = server
            .mock("POST", mockito::Matcher::Regex(r"^/api/2\.x/volumes\?names=.*".into()))
            .with_status(200)
            .with_body(
                r#"{"items":[{"name":"pve-pure1-200-disk0","provisioned":1073741824,"serial":"BBBBBBBBBBBBBBBBBBBBBBBB","destroyed":false,"created":1700000000000}]}"#,
            )
            .create();
        server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/hosts\?filter=.*".into()))
            .with_status(200)
            .with_body(r#"{"items":[]}"#)
            .create();

        let result = orch.clone_image("pure1", "base-100-disk-0", 200, None);
        assert!(result.is_err(), "expected connect_to_cluster to fail with no matching hosts: {result:?}");
        clone_mock.assert();
    }
}
