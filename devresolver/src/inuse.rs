//! In-use detection (spec.md §4.D "In-use detection").
//!
//! Any of three checks firing means "in use": the device (or a slave)
//! appears in `/proc/mounts`, its `/sys/block/{name}/holders` is non-empty
//! (LVM, dm-crypt, ...), or `fuser -s` succeeds against it. Teardown must
//! hard-refuse if any of these fire.

use std::{fs, path::Path, process::Command, time::Duration};

use log::debug;
use vol_api::error::DeviceError;

const PROC_MOUNTS: &str = "/proc/mounts";
const SYS_BLOCK_ROOT: &str = "/sys/block";
const FUSER_TIMEOUT: Duration = Duration::from_secs(10);

/// True if `device_path` (e.g. `/dev/mapper/3624a9370...`) or any of
/// `slave_names` (e.g. `sdb`, `sdc`) is currently in use.
pub fn is_device_in_use(device_path: &str, slave_names: &[String]) -> Result<bool, DeviceError> {
    is_device_in_use_under(Path::new(PROC_MOUNTS), Path::new(SYS_BLOCK_ROOT), device_path, slave_names)
}

fn is_device_in_use_under(
    mounts_path: &Path,
    sys_block_root: &Path,
    device_path: &str,
    slave_names: &[String],
) -> Result<bool, DeviceError> {
    if is_mounted(mounts_path, device_path, slave_names)? {
        debug!("{device_path} is in use: mounted");
        return Ok(true);
    }
    if has_holders(sys_block_root, device_path, slave_names)? {
        debug!("{device_path} is in use: has holders");
        return Ok(true);
    }
    if is_held_open(device_path) {
        debug!("{device_path} is in use: fuser reports open handles");
        return Ok(true);
    }
    Ok(false)
}

fn is_mounted(mounts_path: &Path, device_path: &str, slave_names: &[String]) -> Result<bool, DeviceError> {
    let contents = match fs::read_to_string(mounts_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(DeviceError::SubprocessFailed {
                command: format!("read({})", mounts_path.display()),
                message: e.to_string(),
            })
        }
    };

    let mapper_name = device_path.rsplit('/').next().unwrap_or(device_path);
    Ok(contents.lines().any(|line| {
        let source = line.split_whitespace().next().unwrap_or("");
        let source_name = source.rsplit('/').next().unwrap_or(source);
        source == device_path
            || source_name == mapper_name
            || slave_names.iter().any(|s| source_name == s)
    }))
}

fn has_holders(sys_block_root: &Path, device_path: &str, slave_names: &[String]) -> Result<bool, DeviceError> {
    let mapper_name = device_path.rsplit('/').next().unwrap_or(device_path);
    for name in std::iter::once(mapper_name).chain(slave_names.iter().map(String::as_str)) {
        let holders_dir = sys_block_root.join(name).join("holders");
        match fs::read_dir(&holders_dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(DeviceError::SubprocessFailed {
                    command: format!("read_dir({})", holders_dir.display()),
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(false)
}

fn is_held_open(device_path: &str) -> bool {
    let mut cmd = Command::new("fuser");
    cmd.arg("-s").arg(device_path);
    match procrun::run(&mut cmd, FUSER_TIMEOUT, |_| false) {
        Ok(out) => out.is_success(),
        // fuser missing or erroring is not itself evidence of in-use; treat
        // conservatively as "not held" so a broken `fuser` doesn't wedge
        // every teardown, but this is logged loudly by procrun already.
        Err(_) => false,
    }
}
