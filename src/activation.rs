//! Activation / deactivation (spec.md §4.E "Activation / deactivation").

use std::fs;
use std::path::Path;

use log::warn;
use sanfabric::Protocol as _;
use vol_api::config::Protocol;
use vol_api::error::OrchestratorError;

use crate::Orchestrator;

const PURE_STANZA_MARKER: &str = "vendor \"PURE\"";
const PURE_STANZA: &str = concat!(
    "devices {\n",
    "\tdevice {\n",
    "\t\tvendor \"PURE\"\n",
    "\t\tproduct \"FlashArray\"\n",
    "\t\tpath_selector \"queue-length 0\"\n",
    "\t\tpath_grouping_policy multibus\n",
    "\t\tpath_checker tur\n",
    "\t\tfast_io_fail_tmo 10\n",
    "\t\tdev_loss_tmo 60\n",
    "\t\tno_path_retry 0\n",
    "\t\thardware_handler \"1 alua\"\n",
    "\t}\n",
    "}\n",
);

impl Orchestrator {
    /// Brings this node's storage path up: array reachability, orphan temp
    /// clone sweep, multipath config, fabric login, and host registration.
    pub fn activate_storage(&self) -> Result<(), OrchestratorError> {
        self.array.array_info()?;
        self.sweep_orphan_temp_clones()?;
        ensure_multipath_stanza()?;

        match self.config.protocol {
            Protocol::Fc => {
                let hbas = sanfabric::fc::hba_ports().map_err(device_err)?;
                if hbas.is_empty() {
                    return Err(OrchestratorError::Other(
                        "no FC HBA ports found on this node".to_owned(),
                    ));
                }
                match sanfabric::fc::remote_ports() {
                    Ok(remotes) if remotes.iter().any(|p| p.is_target) => {}
                    Ok(_) => warn!("no online FC target ports visible to this node's HBAs"),
                    Err(e) => warn!("failed to enumerate FC remote ports: {e}"),
                }
            }
            Protocol::Iscsi => {
                let ports = self.array.list_iscsi_ports()?;
                let portals: Vec<(String, u16)> = ports.iter().map(|p| (p.portal.clone(), p.port)).collect();
                let protocol = sanfabric::IscsiProtocol;
                if let Err(e) = protocol.discover_and_login(&portals) {
                    warn!("iSCSI discovery/login encountered errors: {e}");
                }
                sanfabric::common::rescan_scsi_hosts().map_err(device_err)?;
                sanfabric::common::multipath_reconfigure().map_err(device_err)?;
                sanfabric::common::udev_trigger_and_settle().map_err(device_err)?;
            }
        }

        let initiators = self.local_initiators()?;
        let is_wwn = self.config.protocol == Protocol::Fc;
        self.ensure_host_registered(&initiators, is_wwn)?;
        Ok(())
    }

    /// Tears down every volume in `storage`'s namespace that is connected to
    /// this host and not in use, then logs out of iSCSI portals if nothing
    /// is left connected.
    pub fn deactivate_storage(&self, storage: &str) -> Result<(), OrchestratorError> {
        let glob = self.qualify(&format!("{}-*", naming::storage_prefix(storage)));
        let volumes = self.array.list_volumes(&glob)?;
        let this_host = self.host_name();

        let mut any_connected = false;
        for vol in &volumes {
            if vol.destroyed {
                continue;
            }
            let connections = self.array.list_connections(&vol.name)?;
            if !connections.iter().any(|c| c.host_name == this_host) {
                continue;
            }

            let wwid = vol_api::wwid::serial_to_wwid(&vol.serial);
            match devresolver::lookup::resolve_wwid(&wwid) {
                Ok(Some(resolved)) => match devresolver::teardown::teardown(&resolved) {
                    Ok(()) => self.array.disconnect(&this_host, &vol.name)?,
                    Err(e) => {
                        warn!("skipping deactivation of '{}': {e}", vol.name);
                        any_connected = true;
                        continue;
                    }
                },
                Ok(None) => self.array.disconnect(&this_host, &vol.name)?,
                Err(e) => {
                    warn!("failed to resolve device for '{}': {e}", vol.name);
                    any_connected = true;
                }
            }
        }

        if !any_connected && self.config.protocol == Protocol::Iscsi {
            let ports = self.array.list_iscsi_ports()?;
            let iqns: Vec<String> = ports.iter().map(|p| p.iqn.clone()).collect();
            let protocol = sanfabric::IscsiProtocol;
            if let Err(e) = protocol.cleanup_sessions(&iqns) {
                warn!("failed to log out of iSCSI portals during deactivation: {e}");
            }
        }

        Ok(())
    }

    /// The initiator identifiers to register for this node's host object,
    /// per the configured protocol.
    fn local_initiators(&self) -> Result<Vec<String>, OrchestratorError> {
        match self.config.protocol {
            Protocol::Iscsi => Ok(vec![sanfabric::iscsi::local_iqn().map_err(device_err)?]),
            Protocol::Fc => {
                let hbas = sanfabric::fc::hba_ports().map_err(device_err)?;
                Ok(hbas.iter().map(|p| sanfabric::fc::wwpn_to_array_form(&p.port_name)).collect())
            }
        }
    }
}

fn device_err(e: anyhow::Error) -> OrchestratorError {
    OrchestratorError::Other(e.to_string())
}

fn ensure_multipath_stanza() -> Result<(), OrchestratorError> {
    ensure_multipath_stanza_under(Path::new("/etc"))
}

fn ensure_multipath_stanza_under(root: &Path) -> Result<(), OrchestratorError> {
    let conf_d = root.join("multipath/conf.d");
    if conf_d.is_dir() {
        let target = conf_d.join("pure-storage.conf");
        if fs::read_to_string(&target).map(|s| s.contains(PURE_STANZA_MARKER)).unwrap_or(false) {
            return Ok(());
        }
        return fs::write(&target, PURE_STANZA).map_err(|e| {
            OrchestratorError::Other(format!("failed to write '{}': {e}", target.display()))
        });
    }

    let conf_file = root.join("multipath.conf");
    let existing = fs::read_to_string(&conf_file).unwrap_or_default();
    if existing.contains(PURE_STANZA_MARKER) {
        return Ok(());
    }
    let updated = if existing.is_empty() {
        PURE_STANZA.to_owned()
    } else {
        format!("{existing}\n{PURE_STANZA}")
    };
    fs::write(&conf_file, updated)
        .map_err(|e| OrchestratorError::Other(format!("failed to write '{}': {e}", conf_file.display())))
}
