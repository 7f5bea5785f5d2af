//! Fibre Channel host/port enumeration and rescan (spec.md §4.C "FC").

use std::{fs, path::Path, process::Command};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use crate::SUBPROCESS_TIMEOUT;

const FC_HOST_ROOT: &str = "/sys/class/fc_host";
const FC_REMOTE_PORTS_ROOT: &str = "/sys/class/fc_remote_ports";
const SCSI_HOST_ROOT: &str = "/sys/class/scsi_host";

/// A local FC HBA port, read from `/sys/class/fc_host/host*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaPort {
    pub host: String,
    pub port_name: String,
    pub node_name: String,
    pub port_state: String,
    pub port_type: String,
    pub speed: String,
    pub fabric_name: String,
}

/// A remote FC port visible to an HBA, read from `/sys/class/fc_remote_ports`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePort {
    pub name: String,
    pub port_name: String,
    pub is_target: bool,
}

/// Formats a raw colon-separated WWPN (`/sys` form) as the array API expects:
/// lowercase hex, no separators.
pub fn wwpn_to_array_form(wwpn: &str) -> String {
    wwpn.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Formats a raw hex WWPN as a display-form colon-separated string, e.g.
/// "21000024ff5a1b2c" -> "21:00:00:24:ff:5a:1b:2c".
pub fn wwpn_to_display_form(wwpn: &str) -> String {
    let hex: String = wwpn.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    hex.as_bytes()
        .chunks(2)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// Enumerates local FC HBA ports.
pub fn hba_ports() -> Result<Vec<HbaPort>, Error> {
    hba_ports_under(Path::new(FC_HOST_ROOT))
}

fn hba_ports_under(root: &Path) -> Result<Vec<HbaPort>, Error> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(format!("Failed to read {}", root.display())),
    };

    let mut ports = Vec::new();
    for entry in entries {
        let entry = entry.context("Failed to read fc_host directory entry")?;
        let host_dir = entry.path();
        let host = entry.file_name().to_string_lossy().into_owned();
        ports.push(HbaPort {
            host,
            port_name: read_attr(&host_dir, "port_name")?,
            node_name: read_attr(&host_dir, "node_name")?,
            port_state: read_attr(&host_dir, "port_state")?,
            port_type: read_attr(&host_dir, "port_type")?,
            speed: read_attr(&host_dir, "speed")?,
            fabric_name: read_attr(&host_dir, "fabric_name")?,
        });
    }
    ports.sort_by(|a, b| a.host.cmp(&b.host));
    Ok(ports)
}

/// Enumerates remote ports visible to local HBAs, flagging which ones
/// identify as FCP targets.
pub fn remote_ports() -> Result<Vec<RemotePort>, Error> {
    remote_ports_under(Path::new(FC_REMOTE_PORTS_ROOT))
}

fn remote_ports_under(root: &Path) -> Result<Vec<RemotePort>, Error> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(format!("Failed to read {}", root.display())),
    };

    let mut ports = Vec::new();
    for entry in entries {
        let entry = entry.context("Failed to read fc_remote_ports directory entry")?;
        let port_dir = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let port_name = read_attr(&port_dir, "port_name")?;
        let roles = read_attr(&port_dir, "roles").unwrap_or_default();
        ports.push(RemotePort {
            name,
            port_name,
            is_target: roles.to_ascii_lowercase().contains("target"),
        });
    }
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

fn read_attr(dir: &Path, attr: &str) -> Result<String, Error> {
    let path = dir.join(attr);
    fs::read_to_string(&path)
        .map(|s| s.trim().to_owned())
        .with_context(|| format!("Failed to read '{}'", path.display()))
}

/// Issues a Loop Initialization Primitive on every local HBA, then rescans
/// the matching SCSI hosts. LIP forces the fabric to re-announce targets;
/// the subsequent `scan` write is what actually makes the kernel re-probe
/// LUNs once the fabric settles.
pub fn rescan_fabric() -> Result<(), Error> {
    rescan_fabric_under(Path::new(FC_HOST_ROOT), Path::new(SCSI_HOST_ROOT))
}

fn rescan_fabric_under(fc_host_root: &Path, scsi_host_root: &Path) -> Result<(), Error> {
    info!("Rescanning FC fabric");
    let entries = match fs::read_dir(fc_host_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist, nothing to rescan", fc_host_root.display());
            return Ok(());
        }
        Err(e) => return Err(e).context(format!("Failed to read {}", fc_host_root.display())),
    };

    for entry in entries {
        let entry = entry.context("Failed to read fc_host directory entry")?;
        let host = entry.file_name().to_string_lossy().into_owned();
        let lip_file = entry.path().join("issue_lip");
        if let Err(e) = fs::write(&lip_file, "1") {
            warn!("Failed to issue LIP on '{}': {e}", lip_file.display());
        }
        let scan_file = scsi_host_root.join(&host).join("scan");
        fs::write(&scan_file, "- - -")
            .with_context(|| format!("Failed to trigger rescan via '{}'", scan_file.display()))?;
    }
    Ok(())
}

/// Runs `fcping`-equivalent liveness is out of scope; this is a thin wrapper
/// kept for parity with `iscsi::sessions` so the `Protocol` trait can treat
/// both uniformly. FC has no concept of a login session to enumerate, so
/// "cleanup" is a no-op beyond the rescan itself.
pub fn cleanup_sessions() -> Result<(), Error> {
    procrun::run_checked(Command::new("true"), SUBPROCESS_TIMEOUT)
        .context("Failed to run FC session cleanup no-op")?;
    Ok(())
}
