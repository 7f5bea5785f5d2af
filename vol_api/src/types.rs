//! Structured record types shared by every layer of the plugin.
//!
//! The upstream array API threads untyped JSON hashes through every call;
//! here the v1/v2 divergence is absorbed once, in `arrayclient::dialect`, and
//! every layer above it only ever sees these structs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical volume on the array, as seen after dialect normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayVolume {
    /// Fully qualified name, including any `{pod}::` prefix.
    pub name: String,
    pub provisioned_bytes: u64,
    pub used_bytes: u64,
    /// 24 lowercase hex chars. `vol_api::wwid::serial_to_wwid` derives the WWID from this.
    pub serial: String,
    pub destroyed: bool,
    pub created: DateTime<Utc>,
    /// `None` when the volume is not pod-qualified.
    pub pod: Option<String>,
}

impl ArrayVolume {
    /// The base name with any `{pod}::` prefix stripped.
    pub fn local_name(&self) -> &str {
        match self.name.split_once("::") {
            Some((_, local)) => local,
            None => &self.name,
        }
    }
}

/// An array snapshot: `{volume}.{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySnapshot {
    pub name: String,
    pub source_volume: String,
    pub suffix: String,
    pub created: DateTime<Utc>,
    pub destroyed: bool,
}

impl ArraySnapshot {
    pub const TEMPLATE_SUFFIX: &'static str = "pve-base";

    pub fn is_template_marker(&self) -> bool {
        self.suffix == Self::TEMPLATE_SUFFIX
    }
}

/// An array-side host object: a named collection of initiator identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub iqns: Vec<String>,
    pub wwns: Vec<String>,
}

impl Host {
    /// Case-insensitive membership check, as required for initiator
    /// idempotence (adding an already-registered initiator must be a no-op).
    pub fn has_initiator(&self, initiator: &str) -> bool {
        let norm = normalize_initiator(initiator);
        self.iqns
            .iter()
            .chain(self.wwns.iter())
            .any(|existing| normalize_initiator(existing) == norm)
    }
}

/// Lowercases and strips `:`/`-` so IQNs and WWNs compare equal regardless of
/// the separator style the caller used.
pub fn normalize_initiator(initiator: &str) -> String {
    initiator
        .to_ascii_lowercase()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect()
}

/// A (Host, ArrayVolume) relation. Carries no further state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub host_name: String,
    pub volume_name: String,
}

/// The four host-side volume name shapes, plus the linked-clone parent.
///
/// The linked-clone string form `base-X/vm-Y-disk-N` is not a fifth case: it
/// parses into `Disk` with `parent` populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedVolname {
    Disk {
        vmid: u32,
        disk_id: u32,
        /// `(base volume name, base vmid)`, e.g. `("base-100-disk-0", 100)`.
        parent: Option<(String, u32)>,
    },
    Base {
        vmid: u32,
        disk_id: u32,
    },
    Cloudinit {
        vmid: u32,
    },
    State {
        vmid: u32,
        snap: String,
    },
}

impl ParsedVolname {
    pub fn vmid(&self) -> u32 {
        match self {
            ParsedVolname::Disk { vmid, .. }
            | ParsedVolname::Base { vmid, .. }
            | ParsedVolname::Cloudinit { vmid }
            | ParsedVolname::State { vmid, .. } => *vmid,
        }
    }

    pub fn disk_index(&self) -> Option<u32> {
        match self {
            ParsedVolname::Disk { disk_id, .. } | ParsedVolname::Base { disk_id, .. } => {
                Some(*disk_id)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ParsedVolname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedVolname::Disk {
                vmid,
                disk_id,
                parent: Some((base_name, _base_vmid)),
            } => write!(f, "{base_name}/vm-{vmid}-disk-{disk_id}"),
            ParsedVolname::Disk {
                vmid, disk_id, ..
            } => write!(f, "vm-{vmid}-disk-{disk_id}"),
            ParsedVolname::Base { vmid, disk_id } => write!(f, "base-{vmid}-disk-{disk_id}"),
            ParsedVolname::Cloudinit { vmid } => write!(f, "vm-{vmid}-cloudinit"),
            ParsedVolname::State { vmid, snap } => write!(f, "vm-{vmid}-state-{snap}"),
        }
    }
}

/// Array or pod capacity, used by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capacity {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl Capacity {
    pub fn available_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Lifecycle state of an array volume from the orchestrator's perspective
/// (spec.md §4.E "State machine"). Not persisted: re-derived from the array
/// and the kernel on every operation, since the core keeps no local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Absent,
    Provisioned,
    Connected,
    InUse,
    Destroyed,
    Eradicated,
}
