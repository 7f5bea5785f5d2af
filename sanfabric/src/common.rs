//! Operations common to both iSCSI and FC: SCSI host rescans, udev, and
//! multipath control (spec.md §4.C "Common").

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Error};
use log::{debug, info};

use crate::SUBPROCESS_TIMEOUT;

const SCSI_HOST_ROOT: &str = "/sys/class/scsi_host";

/// Writes `- - -` to every `/sys/class/scsi_host/*/scan`, asking the kernel
/// to re-probe every bus/target/lun on every SCSI host.
pub fn rescan_scsi_hosts() -> Result<(), Error> {
    rescan_scsi_hosts_under(Path::new(SCSI_HOST_ROOT))
}

fn rescan_scsi_hosts_under(root: &Path) -> Result<(), Error> {
    info!("Rescanning all SCSI hosts");
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist, nothing to rescan", root.display());
            return Ok(());
        }
        Err(e) => return Err(e).context(format!("Failed to read {}", root.display())),
    };

    for entry in entries {
        let entry = entry.context("Failed to read scsi_host directory entry")?;
        let scan_file = entry.path().join("scan");
        fs::write(&scan_file, "- - -")
            .with_context(|| format!("Failed to trigger rescan via '{}'", scan_file.display()))?;
    }
    Ok(())
}

/// Triggers udev to re-evaluate block devices and waits for the queue to
/// settle. A freshly created array volume has been observed to keep
/// returning a stale WWID from the kernel's cache until udev is poked after
/// a rescan; this must run after every rescan, not just on first activation.
pub fn udev_trigger_and_settle() -> Result<(), Error> {
    procrun::run_checked(
        Command::new("udevadm").arg("trigger").arg("--subsystem-match=block"),
        SUBPROCESS_TIMEOUT,
    )
    .context("Failed to trigger udev")?;
    procrun::run_checked(Command::new("udevadm").arg("settle"), SUBPROCESS_TIMEOUT)
        .context("Failed to settle udev queue")?;
    Ok(())
}

/// Asks `multipathd` to reload its configuration and device maps.
pub fn multipath_reconfigure() -> Result<(), Error> {
    procrun::run_checked(
        Command::new("multipathd").arg("reconfigure"),
        SUBPROCESS_TIMEOUT,
    )
    .context("Failed to reconfigure multipathd")?;
    Ok(())
}

/// Flushes a multipath device map. `device` is `None` to flush all unused
/// maps, or `Some(name)` for a specific one (e.g. a WWID).
pub fn multipath_flush(device: Option<&str>) -> Result<(), Error> {
    let mut cmd = Command::new("multipath");
    cmd.arg("-f");
    if let Some(device) = device {
        procrun::validate_argv_token(device, procrun::is_safe_device_char)?;
        cmd.arg(device);
    }
    procrun::run_checked(&mut cmd, SUBPROCESS_TIMEOUT).context("Failed to flush multipath map")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipathdTarget {
    Path,
    Map,
}

impl MultipathdTarget {
    fn as_str(self) -> &'static str {
        match self {
            MultipathdTarget::Path => "path",
            MultipathdTarget::Map => "map",
        }
    }
}

/// `multipathd add|remove path|map {device}`.
pub fn multipathd_add(target: MultipathdTarget, device: &str) -> Result<(), Error> {
    multipathd_command("add", target, device)
}

pub fn multipathd_remove(target: MultipathdTarget, device: &str) -> Result<(), Error> {
    multipathd_command("remove", target, device)
}

fn multipathd_command(verb: &str, target: MultipathdTarget, device: &str) -> Result<(), Error> {
    procrun::validate_argv_token(device, procrun::is_safe_device_char)?;
    procrun::run_checked(
        Command::new("multipathd")
            .arg(verb)
            .arg(target.as_str())
            .arg(device),
        SUBPROCESS_TIMEOUT,
    )
    .with_context(|| format!("Failed to {verb} {} '{device}'", target.as_str()))?;
    Ok(())
}

/// One row of `multipathd show maps raw format "%n %w"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipathMap {
    pub name: String,
    pub wwid: String,
}

/// Lists all active multipath aggregates.
pub fn show_maps() -> Result<Vec<MultipathMap>, Error> {
    let out = procrun::run_checked(
        Command::new("multipathd")
            .arg("show")
            .arg("maps")
            .arg("raw")
            .arg("format")
            .arg("%n %w"),
        SUBPROCESS_TIMEOUT,
    )
    .context("Failed to list multipath maps")?;
    Ok(parse_maps(&out.stdout))
}

fn parse_maps(raw: &str) -> Vec<MultipathMap> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let wwid = parts.next()?;
            Some(MultipathMap {
                name: name.to_owned(),
                wwid: wwid.to_owned(),
            })
        })
        .collect()
}

/// Lists the kernel `sd*` slave device names of a multipath aggregate, from
/// `/sys/block/{name}/slaves`.
pub fn multipath_slaves(mapper_name: &str) -> Result<Vec<String>, Error> {
    multipath_slaves_under(Path::new("/sys/block"), mapper_name)
}

fn multipath_slaves_under(sys_block_root: &Path, mapper_name: &str) -> Result<Vec<String>, Error> {
    let slaves_dir: PathBuf = sys_block_root.join(mapper_name).join("slaves");
    let entries = match fs::read_dir(&slaves_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(format!("Failed to read {}", slaves_dir.display())),
    };
    let mut slaves: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    slaves.sort();
    Ok(slaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_maps_handles_blank_lines() {
        let raw = "mpatha 3624a9370abc\n\nmpathb 3624a9370def\n";
        let maps = parse_maps(raw);
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].name, "mpatha");
        assert_eq!(maps[1].wwid, "3624a9370def");
    }

    #[test]
    fn rescan_scsi_hosts_writes_scan_file_per_host() {
        let tmp = tempfile::tempdir().unwrap();
        for host in ["host0", "host1"] {
            fs::create_dir_all(tmp.path().join(host)).unwrap();
        }
        rescan_scsi_hosts_under(tmp.path()).unwrap();
        for host in ["host0", "host1"] {
            let contents = fs::read_to_string(tmp.path().join(host).join("scan")).unwrap();
            assert_eq!(contents, "- - -");
        }
    }

    #[test]
    fn rescan_scsi_hosts_tolerates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        rescan_scsi_hosts_under(&tmp.path().join("does-not-exist")).unwrap();
    }

    #[test]
    fn multipath_slaves_lists_sorted_names() {
        let tmp = tempfile::tempdir().unwrap();
        let slaves_dir = tmp.path().join("dm-0").join("slaves");
        fs::create_dir_all(&slaves_dir).unwrap();
        fs::write(slaves_dir.join("sdc"), "").unwrap();
        fs::write(slaves_dir.join("sdb"), "").unwrap();
        let slaves = multipath_slaves_under(tmp.path(), "dm-0").unwrap();
        assert_eq!(slaves, vec!["sdb".to_owned(), "sdc".to_owned()]);
    }

    #[test]
    fn multipath_slaves_empty_when_no_aggregate() {
        let tmp = tempfile::tempdir().unwrap();
        let slaves = multipath_slaves_under(tmp.path(), "dm-missing").unwrap();
        assert!(slaves.is_empty());
    }
}
