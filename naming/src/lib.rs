//! Component A — Naming. Pure functions, no I/O (spec.md §4.A).
//!
//! Every operation here is a total function over strings; nothing touches
//! the array or the kernel. The array's own grammar is bit-exact per
//! spec.md §6:
//!
//! ```text
//! volume:   pve-([A-Za-z0-9_]{1,24})-(\d+)-(disk\d+|cloudinit|state-[A-Za-z0-9-]+|vmconf-[A-Za-z0-9-]+)
//! snapshot: {volume}\.(pve-snap-[A-Za-z0-9-]+|pve-base)
//! host:     pve-[A-Za-z0-9-]{1,20}-([A-Za-z0-9-]{1,20}|shared)
//! pod:      {pod}::{name}
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use vol_api::error::NamingError;
use vol_api::types::ParsedVolname;

const MAX_STORAGE_LEN: usize = 24;
const MAX_SNAPSHOT_SUFFIX_LEN: usize = 64;
const MAX_ARRAY_NAME_LEN: usize = 63;

static VOLUME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^pve-
        (?P<storage>[A-Za-z0-9_-]+?)-
        (?P<vmid>\d+)-
        (?P<role>disk\d+|cloudinit|state-[A-Za-z0-9-]+|vmconf-[A-Za-z0-9-]+)
        $",
    )
    .unwrap()
});

static HOST_VOL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^vm-(?P<vmid>\d+)-disk-(?P<disk>\d+)$").unwrap()
});
static HOST_BASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^base-(?P<vmid>\d+)-disk-(?P<disk>\d+)$").unwrap()
});
static HOST_CLOUDINIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^vm-(?P<vmid>\d+)-cloudinit$").unwrap());
static HOST_STATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^vm-(?P<vmid>\d+)-state-(?P<snap>[A-Za-z0-9-]+)$").unwrap()
});

static ARRAY_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$").unwrap());

/// The array-side volume role, as decoded from `decode_volume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayRole {
    Disk(u32),
    Cloudinit,
    State(String),
    VmConf(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedArrayVolume {
    pub storage: String,
    pub vmid: u32,
    pub role: ArrayRole,
}

/// Collapses whitespace to `-`, strips anything outside
/// `[A-Za-z0-9_-]`, forces a leading alphanumeric, strips trailing
/// separators, and caps length at `max_len`. Substitutes `"pve"` if the
/// result would be empty.
pub fn sanitize_for_array(input: &str, max_len: usize) -> String {
    let collapsed: String = input
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect();

    let mut filtered: String = collapsed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    // Ensure leading alphanumeric.
    while let Some(c) = filtered.chars().next() {
        if c.is_ascii_alphanumeric() {
            break;
        }
        filtered.remove(0);
    }

    // Strip trailing separators.
    while filtered.ends_with('-') || filtered.ends_with('_') {
        filtered.pop();
    }

    if filtered.len() > max_len {
        filtered.truncate(max_len);
        while filtered.ends_with('-') || filtered.ends_with('_') {
            filtered.pop();
        }
    }

    if filtered.is_empty() {
        "pve".to_owned()
    } else {
        filtered
    }
}

/// `is_valid_array_name` (spec.md §4.A): 1-63 chars, leading alphanumeric,
/// `[A-Za-z0-9_-]` only.
pub fn is_valid_array_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_ARRAY_NAME_LEN && ARRAY_NAME_RE.is_match(name)
}

/// Sanitizes a storage name for use in an array volume name: collapse,
/// strip, cap, then substitute `-` -> `_` so `-` stays a reliable field
/// separator in the assembled name.
fn sanitize_storage_field(storage: &str) -> String {
    sanitize_for_array(storage, MAX_STORAGE_LEN).replace('-', "_")
}

/// `encode_volume(storage, vmid, diskid)` -> `pve-{storage}-{vmid}-disk{diskid}`.
pub fn encode_volume(storage: &str, vmid: u32, disk_id: u32) -> String {
    format!("pve-{}-{vmid}-disk{disk_id}", sanitize_storage_field(storage))
}

/// `encode_cloudinit(storage, vmid)` -> `pve-{storage}-{vmid}-cloudinit`.
pub fn encode_cloudinit(storage: &str, vmid: u32) -> String {
    format!("pve-{}-{vmid}-cloudinit", sanitize_storage_field(storage))
}

/// `encode_state(storage, vmid, snap)` -> `pve-{storage}-{vmid}-state-{snap}`.
/// `snap` must already be array-safe (run it through `encode_snapshot`'s
/// sanitizer first if it came from user input).
pub fn encode_state(storage: &str, vmid: u32, snap: &str) -> String {
    format!(
        "pve-{}-{vmid}-state-{}",
        sanitize_storage_field(storage),
        sanitize_snapshot_component(snap)
    )
}

/// `pve-{storage}-{vmid}` prefix shared by every role shape of one volume
/// family; the orchestrator appends `-*` to build the array-side glob for
/// "every volume belonging to this VMID".
pub fn array_prefix(storage: &str, vmid: u32) -> String {
    format!("pve-{}-{vmid}", sanitize_storage_field(storage))
}

/// `pve-{storage}` prefix shared by every volume family in one storage,
/// across every VMID; used to build the storage-wide glob `deactivate_storage`
/// scans.
pub fn storage_prefix(storage: &str) -> String {
    format!("pve-{}", sanitize_storage_field(storage))
}

/// Decodes an array volume name into its structured components. Rejects any
/// name containing `.` (those are snapshot forms, not volumes).
pub fn decode_volume(name: &str) -> Option<DecodedArrayVolume> {
    if name.contains('.') {
        return None;
    }
    let caps = VOLUME_RE.captures(name)?;
    let storage = caps.name("storage")?.as_str().to_owned();
    let vmid: u32 = caps.name("vmid")?.as_str().parse().ok()?;
    let role_str = caps.name("role")?.as_str();

    let role = if let Some(rest) = role_str.strip_prefix("disk") {
        ArrayRole::Disk(rest.parse().ok()?)
    } else if role_str == "cloudinit" {
        ArrayRole::Cloudinit
    } else if let Some(rest) = role_str.strip_prefix("state-") {
        ArrayRole::State(rest.to_owned())
    } else if let Some(rest) = role_str.strip_prefix("vmconf-") {
        ArrayRole::VmConf(rest.to_owned())
    } else {
        return None;
    };

    Some(DecodedArrayVolume { storage, vmid, role })
}

/// Sanitizes a punctuation-bearing name down to the stricter snapshot-suffix
/// charset: only `[A-Za-z0-9-]` survive, everything else (including `_` and
/// `.`) collapses to `-`, and consecutive `-` collapse to one. This is lossy
/// by design: `a_b` and `a-b` alias.
fn sanitize_snapshot_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_dash = false;
    for c in input.chars() {
        let mapped = if c.is_ascii_alphanumeric() { Some(c) } else if c == '-' { Some('-') } else { None };
        match mapped {
            Some(c) if c != '-' => {
                out.push(c);
                last_was_dash = false;
            }
            _ => {
                if !last_was_dash && !out.is_empty() {
                    out.push('-');
                }
                last_was_dash = true;
            }
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// `encode_snapshot(snap_name)` -> `pve-snap-{sanitized}`, suffix length
/// capped so the total suffix is <= 64 chars.
pub fn encode_snapshot(snap_name: &str) -> String {
    const PREFIX: &str = "pve-snap-";
    let budget = MAX_SNAPSHOT_SUFFIX_LEN.saturating_sub(PREFIX.len());
    let mut sanitized = sanitize_snapshot_component(snap_name);
    if sanitized.len() > budget {
        sanitized.truncate(budget);
        while sanitized.ends_with('-') {
            sanitized.pop();
        }
    }
    format!("{PREFIX}{sanitized}")
}

/// The fixed template-marker snapshot suffix.
pub const TEMPLATE_SNAPSHOT_SUFFIX: &str = "pve-base";

/// Splits `{volume}.{suffix}` into its two parts. Array volume names never
/// contain `.`, so the first (and only) dot is the separator.
pub fn decode_snapshot_name(full: &str) -> Option<(&str, &str)> {
    full.split_once('.')
}

/// `encode_config_volume(storage, vmid, snap)` ->
/// `pve-{storage}-{vmid}-vmconf-{snap}`, with `snap` truncated so the total
/// length is <= 63 and no trailing separator survives truncation.
pub fn encode_config_volume(storage: &str, vmid: u32, snap: &str) -> String {
    let storage = sanitize_storage_field(storage);
    let prefix = format!("pve-{storage}-{vmid}-vmconf-");
    let budget = MAX_ARRAY_NAME_LEN.saturating_sub(prefix.len());
    let mut snap_part = sanitize_snapshot_component(snap);
    if snap_part.len() > budget {
        snap_part.truncate(budget);
        while snap_part.ends_with('-') {
            snap_part.pop();
        }
    }
    format!("{prefix}{snap_part}")
}

/// `encode_host(cluster, node)` -> `pve-{cluster}-{node}` or
/// `pve-{cluster}-shared` when `node` is `None`.
pub fn encode_host(cluster: &str, node: Option<&str>) -> String {
    match node {
        Some(node) => format!("pve-{cluster}-{node}"),
        None => format!("pve-{cluster}-shared"),
    }
}

/// Parses a host-side volume name into its structured `ParsedVolname`,
/// including the linked-clone `base-X-disk-M/vm-Y-disk-N` form.
pub fn parse_host_volname(name: &str) -> Result<ParsedVolname, NamingError> {
    if let Some((parent, child)) = name.split_once('/') {
        let base_caps = HOST_BASE_RE
            .captures(parent)
            .ok_or_else(|| NamingError::UnrecognizedVolname(name.to_owned()))?;
        let base_vmid: u32 = base_caps["vmid"].parse().unwrap();
        let child_caps = HOST_VOL_RE
            .captures(child)
            .ok_or_else(|| NamingError::UnrecognizedVolname(name.to_owned()))?;
        let vmid: u32 = child_caps["vmid"].parse().unwrap();
        let disk_id: u32 = child_caps["disk"].parse().unwrap();
        return Ok(ParsedVolname::Disk {
            vmid,
            disk_id,
            parent: Some((parent.to_owned(), base_vmid)),
        });
    }

    if let Some(caps) = HOST_VOL_RE.captures(name) {
        return Ok(ParsedVolname::Disk {
            vmid: caps["vmid"].parse().unwrap(),
            disk_id: caps["disk"].parse().unwrap(),
            parent: None,
        });
    }
    if let Some(caps) = HOST_BASE_RE.captures(name) {
        return Ok(ParsedVolname::Base {
            vmid: caps["vmid"].parse().unwrap(),
            disk_id: caps["disk"].parse().unwrap(),
        });
    }
    if let Some(caps) = HOST_CLOUDINIT_RE.captures(name) {
        return Ok(ParsedVolname::Cloudinit {
            vmid: caps["vmid"].parse().unwrap(),
        });
    }
    if let Some(caps) = HOST_STATE_RE.captures(name) {
        return Ok(ParsedVolname::State {
            vmid: caps["vmid"].parse().unwrap(),
            snap: caps["snap"].to_owned(),
        });
    }

    Err(NamingError::UnrecognizedVolname(name.to_owned()))
}

/// `pve_to_array(storage, host_volname)`: the array-side base name (without
/// any pod prefix) for a host-side volume name, covering all shapes
/// including the linked-clone form (the child `vm-Y-disk-N` is what gets
/// encoded; the parent only carries naming context on the host side).
pub fn pve_to_array(storage: &str, host_volname: &str) -> Result<String, NamingError> {
    match parse_host_volname(host_volname)? {
        ParsedVolname::Disk { vmid, disk_id, .. } => Ok(encode_volume(storage, vmid, disk_id)),
        ParsedVolname::Base { vmid, disk_id } => Ok(encode_volume(storage, vmid, disk_id)),
        ParsedVolname::Cloudinit { vmid } => Ok(encode_cloudinit(storage, vmid)),
        ParsedVolname::State { vmid, snap } => Ok(encode_state(storage, vmid, &snap)),
    }
}

/// `array_to_pve`: rebuilds the host-side name for an array volume. Since a
/// decoded array volume alone cannot say whether a `disk{N}` role is a plain
/// VM disk or a template, or whether it has a linked-clone parent, those
/// facts are supplied by the caller (the orchestrator, which already knows
/// them from the snapshot listing and its own clone bookkeeping).
pub fn array_to_pve(
    decoded: &DecodedArrayVolume,
    is_template: bool,
    linked_clone_parent: Option<&str>,
) -> Option<String> {
    match &decoded.role {
        ArrayRole::Disk(n) => {
            if let Some(parent) = linked_clone_parent {
                Some(format!("{parent}/vm-{}-disk-{n}", decoded.vmid))
            } else if is_template {
                Some(format!("base-{}-disk-{n}", decoded.vmid))
            } else {
                Some(format!("vm-{}-disk-{n}", decoded.vmid))
            }
        }
        ArrayRole::Cloudinit => Some(format!("vm-{}-cloudinit", decoded.vmid)),
        ArrayRole::State(snap) => Some(format!("vm-{}-state-{snap}", decoded.vmid)),
        // Config-backup volumes are an internal side-channel; they are never
        // represented as a host-visible volume.
        ArrayRole::VmConf(_) => None,
    }
}

/// Prefixes a name with its ActiveCluster pod qualifier, if any.
pub fn qualify_pod(pod: Option<&str>, name: &str) -> String {
    match pod {
        Some(pod) => format!("{pod}::{name}"),
        None => name.to_owned(),
    }
}

/// Splits a (possibly) pod-qualified name back into `(pod, local_name)`.
pub fn unqualify_pod(name: &str) -> (Option<&str>, &str) {
    match name.split_once("::") {
        Some((pod, local)) => (Some(pod), local),
        None => (None, name),
    }
}
