//! Resize (spec.md §4.E "Resize").

use vol_api::error::OrchestratorError;

use crate::Orchestrator;

impl Orchestrator {
    /// Grows `host_volname` to `new_size_bytes`. Shrinking is never allowed
    /// (spec.md §4.E "Resize" invariant); an equal size is a no-op. When
    /// `online` (the VM is running with the device already attached), the
    /// new size is pushed to the kernel via a fabric rescan and multipath
    /// reload rather than by waiting for a fresh device to appear.
    pub fn resize(
        &self,
        storage: &str,
        host_volname: &str,
        new_size_bytes: u64,
        online: bool,
    ) -> Result<(), OrchestratorError> {
        let array_base = naming::pve_to_array(storage, host_volname)?;
        let full_name = self.qualify(&array_base);

        let current = self
            .array
            .get_volume(&full_name)?
            .ok_or_else(|| OrchestratorError::Other(format!("volume '{full_name}' does not exist")))?;

        if new_size_bytes < current.provisioned_bytes {
            return Err(OrchestratorError::ShrinkNotAllowed(host_volname.to_owned()));
        }
        if new_size_bytes == current.provisioned_bytes {
            return Ok(());
        }

        self.array.resize_volume(&full_name, new_size_bytes)?;

        if online {
            let protocol = sanfabric::protocol::for_kind(self.config.protocol);
            protocol.rescan_fabric().map_err(|e| OrchestratorError::Other(e.to_string()))?;
            sanfabric::common::multipath_reconfigure().map_err(|e| OrchestratorError::Other(e.to_string()))?;
        }

        Ok(())
    }
}
