//! Config backup (spec.md §4.E "Config backup").
//!
//! A small side-channel volume, one per `(storage, vmid, snap)`, carrying a
//! plain-text copy of the VM/container configuration alongside its
//! snapshot. The host platform never sees this volume as a disk
//! (`naming::array_to_pve` returns `None` for `ArrayRole::VmConf`); it exists
//! purely so a snapshot taken on the array preserves the config that went
//! with it.

use std::fs;
use std::path::Path;
use std::process::Command;

use vol_api::error::OrchestratorError;

use crate::Orchestrator;

const CONFIG_VOLUME_SIZE_BYTES: u64 = 1024 * 1024;
const CONFIG_FILE_NAME: &str = "config";

impl Orchestrator {
    /// Provisions a 1 MiB ext4-formatted volume, writes `contents` to it as
    /// `config`, and leaves it disconnected. Best-effort from the caller's
    /// point of view: a failure here must not fail the snapshot it
    /// accompanies (spec.md §4.E "Snapshot").
    pub(crate) fn backup_vm_config(
        &self,
        storage: &str,
        vmid: u32,
        snap: &str,
        contents: &[u8],
    ) -> Result<(), OrchestratorError> {
        let array_name = naming::encode_config_volume(storage, vmid, snap);
        let full_name = self.qualify(&array_name);

        let created = self.array.create_volume(&full_name, CONFIG_VOLUME_SIZE_BYTES)?;

        if let Err(e) = self.array.connect(&self.host_name(), &full_name) {
            let _ = self.array.destroy_volume(&full_name);
            return Err(e.into());
        }

        if let Err(e) = self.format_and_write(&created.serial, contents) {
            let _ = self.array.disconnect(&self.host_name(), &full_name);
            let _ = self.array.destroy_volume(&full_name);
            return Err(e);
        }

        self.array.disconnect(&self.host_name(), &full_name)?;
        Ok(())
    }

    fn format_and_write(&self, serial: &str, contents: &[u8]) -> Result<(), OrchestratorError> {
        let resolved = self.wait_for_local_device(serial)?;
        mkfs_ext4(&resolved.path)?;

        let mount_point = tempfile::tempdir()
            .map_err(|e| OrchestratorError::Other(format!("failed to create mount point: {e}")))?;
        mount(&resolved.path, mount_point.path())?;

        let write_result = fs::write(mount_point.path().join(CONFIG_FILE_NAME), contents)
            .map_err(|e| OrchestratorError::Other(format!("failed to write config backup contents: {e}")));
        let unmount_result = unmount(mount_point.path());

        write_result?;
        unmount_result?;

        devresolver::teardown::teardown(&resolved)?;
        Ok(())
    }

    /// Deletes every config-backup volume belonging to `(storage, vmid)`,
    /// regardless of snapshot suffix. Run when the VM's last remaining disk
    /// on this storage is freed: nothing will ever restore to those
    /// snapshots again.
    pub(crate) fn delete_all_config_backups(&self, storage: &str, vmid: u32) -> Result<(), OrchestratorError> {
        let glob = self.qualify(&format!("{}-vmconf-*", naming::array_prefix(storage, vmid)));
        for vol in self.array.list_volumes(&glob)? {
            if vol.destroyed {
                continue;
            }
            self.array.destroy_volume(&vol.name)?;
        }
        Ok(())
    }

    /// Deletes the single config-backup volume for `(storage, vmid, snap)`,
    /// a no-op if it was never created (spec.md Non-goals: config backup is
    /// best-effort, so its absence is not itself an error).
    pub(crate) fn delete_config_backup(&self, storage: &str, vmid: u32, snap: &str) -> Result<(), OrchestratorError> {
        let array_name = naming::encode_config_volume(storage, vmid, snap);
        let full_name = self.qualify(&array_name);
        if self.array.get_volume(&full_name)?.is_some() {
            self.array.destroy_volume(&full_name)?;
        }
        Ok(())
    }
}

fn mkfs_ext4(device_path: &str) -> Result<(), OrchestratorError> {
    procrun::validate_argv_token(device_path, procrun::is_safe_device_char)
        .map_err(|e| OrchestratorError::Other(e.to_string()))?;
    procrun::run_checked(
        Command::new("mkfs.ext4").arg("-O").arg("^has_journal").arg("-F").arg(device_path),
        sanfabric::SUBPROCESS_TIMEOUT,
    )
    .map_err(|e| OrchestratorError::Other(format!("mkfs.ext4 on '{device_path}' failed: {e}")))?;
    Ok(())
}

fn mount(device_path: &str, mount_point: &Path) -> Result<(), OrchestratorError> {
    procrun::validate_argv_token(device_path, procrun::is_safe_device_char)
        .map_err(|e| OrchestratorError::Other(e.to_string()))?;
    procrun::run_checked(
        Command::new("mount").arg(device_path).arg(mount_point),
        sanfabric::SUBPROCESS_TIMEOUT,
    )
    .map_err(|e| OrchestratorError::Other(format!("mount of '{device_path}' failed: {e}")))?;
    Ok(())
}

fn unmount(mount_point: &Path) -> Result<(), OrchestratorError> {
    procrun::run_checked(Command::new("umount").arg(mount_point), sanfabric::SUBPROCESS_TIMEOUT)
        .map_err(|e| OrchestratorError::Other(format!("umount of '{}' failed: {e}", mount_point.display())))?;
    Ok(())
}
