//! WWID -> local block device resolution (spec.md §4.D "Lookup").
//!
//! Three fallback tiers, in order: a multipath aggregate, then
//! `/dev/disk/by-id`, then a raw sysfs `vpd_pg80` scan. Every tier does an
//! exact match on WWID, never a substring match — substring matches have
//! been observed in practice to return a sibling LUN sharing a prefix.

use std::{fs, path::Path};

use log::{debug, trace};
use vol_api::error::DeviceError;

const BY_ID_ROOT: &str = "/dev/disk/by-id";
const SYS_BLOCK_ROOT: &str = "/sys/block";
const DEV_MAPPER_ROOT: &str = "/dev/mapper";

/// A block device resolved from a WWID, plus how it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub wwid: String,
    pub path: String,
    pub mapper_name: Option<String>,
}

/// Resolves `wwid` to a local block device, or `Ok(None)` if nothing matches
/// yet (the caller decides whether that's an error).
pub fn resolve_wwid(wwid: &str) -> Result<Option<ResolvedDevice>, DeviceError> {
    let wwid = wwid.to_ascii_lowercase();

    if let Some(resolved) = resolve_via_multipath(&wwid)? {
        return Ok(Some(resolved));
    }
    if let Some(resolved) = resolve_via_by_id(&wwid, Path::new(BY_ID_ROOT))? {
        return Ok(Some(resolved));
    }
    if let Some(resolved) = resolve_via_vpd_scan(&wwid, Path::new(SYS_BLOCK_ROOT))? {
        return Ok(Some(resolved));
    }
    Ok(None)
}

fn resolve_via_multipath(wwid: &str) -> Result<Option<ResolvedDevice>, DeviceError> {
    let maps = sanfabric::common::show_maps().map_err(|e| DeviceError::SubprocessFailed {
        command: "multipathd show maps".to_owned(),
        message: e.to_string(),
    })?;

    let found = maps
        .into_iter()
        .find(|m| m.wwid.eq_ignore_ascii_case(wwid));

    match found {
        Some(m) => {
            debug!("Resolved wwid {wwid} to multipath aggregate {}", m.name);
            let path = format!("{DEV_MAPPER_ROOT}/{}", m.name);
            untaint_path(&path)?;
            Ok(Some(ResolvedDevice {
                wwid: wwid.to_owned(),
                path,
                mapper_name: Some(m.name),
            }))
        }
        None => Ok(None),
    }
}

fn resolve_via_by_id(wwid: &str, root: &Path) -> Result<Option<ResolvedDevice>, DeviceError> {
    for candidate in [format!("wwn-0x{wwid}"), format!("scsi-{wwid}")] {
        let path = root.join(&candidate);
        if path.exists() {
            trace!("Resolved wwid {wwid} via by-id entry '{candidate}'");
            let path_str = path.to_string_lossy().into_owned();
            untaint_path(&path_str)?;
            return Ok(Some(ResolvedDevice {
                wwid: wwid.to_owned(),
                path: path_str,
                mapper_name: None,
            }));
        }
    }
    Ok(None)
}

fn resolve_via_vpd_scan(wwid: &str, sys_block_root: &Path) -> Result<Option<ResolvedDevice>, DeviceError> {
    let entries = match fs::read_dir(sys_block_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DeviceError::SubprocessFailed {
                command: format!("read_dir({})", sys_block_root.display()),
                message: e.to_string(),
            })
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let vpd_path = entry.path().join("device").join("vpd_pg80");
        let Ok(raw) = fs::read(&vpd_path) else {
            continue;
        };
        if vpd_identifies_wwid(&raw, wwid) {
            trace!("Resolved wwid {wwid} via vpd_pg80 scan on '{name}'");
            let path = format!("/dev/{name}");
            untaint_path(&path)?;
            return Ok(Some(ResolvedDevice {
                wwid: wwid.to_owned(),
                path,
                mapper_name: None,
            }));
        }
    }
    Ok(None)
}

/// VPD page 0x83 carries a 4-byte header followed by one or more
/// identification descriptors. The NAA identifier descriptor this array
/// populates is exactly the WWID's binary form; hex-encoding the remainder
/// of the buffer and comparing for exact equality avoids the substring
/// false-positives that plagued the original implementation.
fn vpd_identifies_wwid(raw: &[u8], wwid: &str) -> bool {
    if raw.len() <= 4 {
        return false;
    }
    let hex: String = raw[4..].iter().map(|b| format!("{b:02x}")).collect();
    hex == wwid
}

/// Validates that a resolved device path contains only characters safe to
/// hand to a subprocess or open directly: no shell metacharacters can have
/// entered from an untrusted WWID or mapper name by construction, but this
/// is the last line of defense before the path crosses that boundary.
fn untaint_path(path: &str) -> Result<(), DeviceError> {
    let safe = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'));
    if !safe {
        return Err(DeviceError::UnsafeDeviceName(path.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_id_matches_wwn_prefixed_exact_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let wwid = "3624a9370abc0000000000000000abcd";
        fs::write(tmp.path().join(format!("wwn-0x{wwid}")), "").unwrap();
        // A sibling with an extra trailing digit must not match.
        fs::write(tmp.path().join(format!("wwn-0x{wwid}9")), "").unwrap();

        let resolved = resolve_via_by_id(wwid, tmp.path()).unwrap().unwrap();
        assert_eq!(resolved.path, tmp.path().join(format!("wwn-0x{wwid}")).to_string_lossy());
    }

    #[test]
    fn by_id_no_match_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(resolve_via_by_id("3624a9370deadbeef0000000000abcd", tmp.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn vpd_scan_requires_exact_hex_match() {
        let tmp = tempfile::tempdir().unwrap();
        let wwid = "3624a9370abc0000000000000000abcd";
        let device_dir = tmp.path().join("sda").join("device");
        fs::create_dir_all(&device_dir).unwrap();

        let mut raw = vec![0u8; 4];
        for i in (0..wwid.len()).step_by(2) {
            raw.push(u8::from_str_radix(&wwid[i..i + 2], 16).unwrap());
        }
        fs::write(device_dir.join("vpd_pg80"), &raw).unwrap();

        let resolved = resolve_via_vpd_scan(wwid, tmp.path()).unwrap().unwrap();
        assert_eq!(resolved.path, "/dev/sda");
    }

    #[test]
    fn vpd_scan_rejects_prefix_collision() {
        // A device whose vpd data only starts with the wwid (but has more
        // bytes) must not match -- this is the sibling-LUN failure mode.
        let tmp = tempfile::tempdir().unwrap();
        let wwid = "3624a9370abc0000000000000000abcd";
        let device_dir = tmp.path().join("sdb").join("device");
        fs::create_dir_all(&device_dir).unwrap();

        let mut raw = vec![0u8; 4];
        for i in (0..wwid.len()).step_by(2) {
            raw.push(u8::from_str_radix(&wwid[i..i + 2], 16).unwrap());
        }
        raw.push(0xff);
        fs::write(device_dir.join("vpd_pg80"), &raw).unwrap();

        assert!(resolve_via_vpd_scan(wwid, tmp.path()).unwrap().is_none());
    }

    #[test]
    fn untaint_path_rejects_shell_metacharacters() {
        assert!(untaint_path("/dev/mapper/3624a9370abc").is_ok());
        assert!(untaint_path("/dev/mapper/foo; rm -rf /").is_err());
    }
}
