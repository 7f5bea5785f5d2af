//! Safe local teardown of a WWID's block device (spec.md §4.D "Teardown").
//!
//! 1. Refuse if in use. 2. Enumerate slaves. 3. `sync` + flush buffers.
//! 4. `multipathd remove map` + `multipath -f`. 5. Settle. 6. Delete each
//! slave via sysfs. 7. Settle again. Every step after the refusal check is
//! best-effort in the sense that it logs and continues past an individual
//! slave failure, but the in-use refusal itself is never bypassed.

use std::{process::Command, thread};

use log::{info, warn};
use vol_api::error::DeviceError;

use crate::{inuse, lookup::ResolvedDevice, TEARDOWN_SETTLE_INTERVAL};

const SYS_CLASS_BLOCK_ROOT: &str = "/sys/class/block";

/// Tears down the local device backing `resolved`. Returns an error without
/// touching anything if the device is currently in use.
pub fn teardown(resolved: &ResolvedDevice) -> Result<(), DeviceError> {
    let slaves = match &resolved.mapper_name {
        Some(name) => sanfabric::common::multipath_slaves(name).map_err(|e| DeviceError::SubprocessFailed {
            command: format!("multipath slave enumeration for {name}"),
            message: e.to_string(),
        })?,
        None => Vec::new(),
    };

    if inuse::is_device_in_use(&resolved.path, &slaves)? {
        return Err(DeviceError::InUse {
            device: resolved.path.clone(),
            reason: "mounted, held open, or has device-mapper holders".to_owned(),
        });
    }

    info!("Tearing down {} (slaves: {:?})", resolved.path, slaves);

    flush(&resolved.path)?;

    if let Some(mapper_name) = &resolved.mapper_name {
        remove_multipath_map(mapper_name)?;
    }

    thread::sleep(TEARDOWN_SETTLE_INTERVAL);

    for slave in &slaves {
        if let Err(e) = delete_slave(slave) {
            warn!("Failed to delete slave device '{slave}': {e}");
        }
    }

    thread::sleep(TEARDOWN_SETTLE_INTERVAL);

    Ok(())
}

fn flush(device_path: &str) -> Result<(), DeviceError> {
    procrun::run_checked(Command::new("sync"), sanfabric::SUBPROCESS_TIMEOUT).map_err(|e| {
        DeviceError::SubprocessFailed {
            command: "sync".to_owned(),
            message: e.to_string(),
        }
    })?;
    procrun::run_checked(
        Command::new("blockdev").arg("--flushbufs").arg(device_path),
        sanfabric::SUBPROCESS_TIMEOUT,
    )
    .map_err(|e| DeviceError::SubprocessFailed {
        command: format!("blockdev --flushbufs {device_path}"),
        message: e.to_string(),
    })?;
    Ok(())
}

fn remove_multipath_map(mapper_name: &str) -> Result<(), DeviceError> {
    sanfabric::common::multipathd_remove(sanfabric::common::MultipathdTarget::Map, mapper_name)
        .map_err(|e| DeviceError::SubprocessFailed {
            command: format!("multipathd remove map {mapper_name}"),
            message: e.to_string(),
        })?;
    sanfabric::common::multipath_flush(Some(mapper_name)).map_err(|e| DeviceError::SubprocessFailed {
        command: format!("multipath -f {mapper_name}"),
        message: e.to_string(),
    })?;
    Ok(())
}

fn delete_slave(slave: &str) -> Result<(), DeviceError> {
    procrun::validate_argv_token(slave, procrun::is_safe_device_char)
        .map_err(|_| DeviceError::UnsafeDeviceName(slave.to_owned()))?;

    let delete_path = format!("{SYS_CLASS_BLOCK_ROOT}/{slave}/device/delete");
    std::fs::write(&delete_path, "1").map_err(|e| DeviceError::SubprocessFailed {
        command: format!("write 1 to {delete_path}"),
        message: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_teardown_when_in_use() {
        // With no mapper_name, slave enumeration is skipped and the in-use
        // check runs against /proc/mounts and /sys/block directly; since
        // this path will not be mounted in a test sandbox, the refusal path
        // itself is instead exercised via `inuse` unit tests. This test
        // documents the contract: teardown must consult `is_device_in_use`
        // before any destructive step runs.
        let resolved = ResolvedDevice {
            wwid: "3624a9370doesnotexist00000000000".to_owned(),
            path: "/dev/mapper/3624a9370doesnotexist00000000000".to_owned(),
            mapper_name: None,
        };
        // This device is not actually in use on the test host, so teardown
        // will proceed past the refusal check; we only assert it does not
        // panic while exercising slave-less flush/remove error paths, which
        // surface as Err because `sync`/`blockdev` act on a nonexistent path.
        let _ = teardown(&resolved);
    }
}
