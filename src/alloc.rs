//! Allocation (spec.md §4.E "Allocation").

use std::collections::BTreeSet;
use std::time::Duration;

use log::warn;
use naming::ArrayRole;
use vol_api::error::{NamingError, OrchestratorError};
use vol_api::types::ParsedVolname;

use crate::Orchestrator;

impl Orchestrator {
    /// `alloc(storage, vmid, fmt, name, size_bytes)`. `fmt` must be `"raw"`;
    /// no other host-side disk format exists for this array family.
    ///
    /// Ordering follows spec.md §5: array create, then host connect, then
    /// (for state/cloudinit shapes only) device appear — never hand back a
    /// host identifier before a state/cloudinit device is actually usable.
    pub fn alloc(
        &self,
        storage: &str,
        vmid: u32,
        fmt: &str,
        name: Option<&str>,
        size_bytes: u64,
    ) -> Result<String, OrchestratorError> {
        if fmt != "raw" {
            return Err(OrchestratorError::Other(format!(
                "unsupported disk format '{fmt}', only 'raw' is supported"
            )));
        }

        let (host_volname, array_name) = self.derive_alloc_name(storage, vmid, name)?;
        let full_name = self.qualify(&array_name);

        if let Some(existing) = self.array.get_volume(&full_name)? {
            if existing.destroyed {
                // A destroyed-but-not-eradicated leftover from a previous
                // failed alloc; must be cleaned up before the name is reused
                // (spec.md §3 invariant).
                self.array.eradicate_volume(&full_name)?;
            } else {
                match naming::parse_host_volname(&host_volname)? {
                    ParsedVolname::State { .. } | ParsedVolname::Cloudinit { .. } => {
                        self.cleanup_orphan(&full_name)?;
                    }
                    _ => return Err(OrchestratorError::VolumeNameInUse(host_volname)),
                }
            }
        }

        let created = self.array.create_volume(&full_name, size_bytes)?;

        if let Err(e) = self.connect_to_cluster(&full_name) {
            let _ = self.array.destroy_volume(&full_name);
            return Err(e);
        }

        let needs_device_now = matches!(
            naming::parse_host_volname(&host_volname)?,
            ParsedVolname::State { .. } | ParsedVolname::Cloudinit { .. }
        );
        if needs_device_now {
            if let Err(e) = self.wait_for_local_device(&created.serial) {
                let _ = self.array.destroy_volume(&full_name);
                return Err(e);
            }
        }

        Ok(host_volname)
    }

    /// Resolves the `(host_volname, array_name)` pair for an alloc call. An
    /// explicit `name` must already be a state/cloudinit shape (disks are
    /// always auto-numbered); otherwise the next-free disk index is scanned.
    fn derive_alloc_name(
        &self,
        storage: &str,
        vmid: u32,
        name: Option<&str>,
    ) -> Result<(String, String), OrchestratorError> {
        if let Some(name) = name {
            return match naming::parse_host_volname(name)? {
                ParsedVolname::State { .. } | ParsedVolname::Cloudinit { .. } => {
                    let array_name = naming::pve_to_array(storage, name)?;
                    Ok((name.to_owned(), array_name))
                }
                _ => Err(OrchestratorError::Other(format!(
                    "alloc with an explicit name only supports state/cloudinit volumes, got '{name}'"
                ))),
            };
        }

        let disk_id = self.next_free_disk_index(storage, vmid)?;
        Ok((
            format!("vm-{vmid}-disk-{disk_id}"),
            naming::encode_volume(storage, vmid, disk_id),
        ))
    }

    /// Scans disk indices 0..999 for the first not already in use by this
    /// `(storage, vmid)` family (spec.md §4.E step 1, §8 disjointness
    /// property).
    pub(crate) fn next_free_disk_index(&self, storage: &str, vmid: u32) -> Result<u32, OrchestratorError> {
        let prefix = naming::array_prefix(storage, vmid);
        let glob = self.qualify(&format!("{prefix}-*"));
        let existing = self.array.list_volumes(&glob)?;

        let mut used = BTreeSet::new();
        for vol in &existing {
            let (_, local) = naming::unqualify_pod(&vol.name);
            if let Some(decoded) = naming::decode_volume(local) {
                if let ArrayRole::Disk(n) = decoded.role {
                    used.insert(n);
                }
            }
        }

        (0..1000u32)
            .find(|n| !used.contains(n))
            .ok_or_else(|| NamingError::DiskIndexExhausted(vmid).into())
    }

    /// Disconnects and soft-deletes a volume left behind by a previous
    /// failed state/cloudinit alloc, so the name can be reused.
    fn cleanup_orphan(&self, full_name: &str) -> Result<(), OrchestratorError> {
        for conn in self.array.list_connections(full_name)? {
            self.array.disconnect(&conn.host_name, full_name)?;
        }
        self.array.destroy_volume(full_name)?;
        Ok(())
    }

    /// Connects `full_name` to every host matching this cluster's host
    /// glob. Connecting to the current node's host is required; every other
    /// host is best-effort (a peer node being briefly unreachable must not
    /// block this node's allocation).
    pub(crate) fn connect_to_cluster(&self, full_name: &str) -> Result<(), OrchestratorError> {
        let cluster_glob = format!("pve-{}-*", self.config.cluster_name);
        let hosts = self.array.list_hosts(&cluster_glob)?;
        let this_host = self.host_name();

        let mut connected_to_self = false;
        for host in &hosts {
            match self.array.connect(&host.name, full_name) {
                Ok(()) => connected_to_self |= host.name == this_host,
                Err(e) if e.is_benign_conflict() => connected_to_self |= host.name == this_host,
                Err(e) if host.name == this_host => return Err(e.into()),
                Err(e) => warn!("best-effort connect of '{full_name}' to host '{}' failed: {e}", host.name),
            }
        }

        if !connected_to_self {
            return Err(OrchestratorError::Other(format!(
                "could not connect volume '{full_name}' to this node's host '{this_host}'; \
                 is the host registered (has activate_storage run)?"
            )));
        }
        Ok(())
    }

    /// Actively waits for `serial`'s WWID to resolve to a local block
    /// device, rescanning the fabric each iteration (spec.md §4.E step 5).
    pub(crate) fn wait_for_local_device(&self, serial: &str) -> Result<devresolver::ResolvedDevice, OrchestratorError> {
        let wwid = vol_api::wwid::serial_to_wwid(serial);
        let protocol = sanfabric::protocol::for_kind(self.config.protocol);
        let timeout = Duration::from_secs(self.config.device_timeout_secs);
        devresolver::wait_for_device(&wwid, timeout, || protocol.rescan_fabric()).map_err(Into::into)
    }
}

