//! v1/v2 response-shape divergence, hidden behind one layer of struct
//! marshalling (spec.md §4.B "Dialect abstraction", Design Notes "Dynamic
//! language idioms -> structured equivalents").
//!
//! Nothing above `arrayclient::ops` ever sees a v1 vs v2 distinction: every
//! wire type here converts into the shared `vol_api::types` structs.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vol_api::types::{ArraySnapshot, ArrayVolume, Capacity, Host};

/// The two API major versions this client understands, preference-ordered
/// newest-first wherever a `Vec<ApiVersion>` is ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    /// The constant the client assumes when `/api/api_version` is missing
    /// and no successive-version probe responds either.
    pub const DEFAULT_FALLBACK: ApiVersion = ApiVersion::V2;

    pub fn as_path_segment(self) -> &'static str {
        match self {
            ApiVersion::V1 => "1.19",
            ApiVersion::V2 => "2.x",
        }
    }

    /// Parses a version string like `"2.23"` or `"1.19"` by major component.
    pub fn parse(raw: &str) -> Option<ApiVersion> {
        let major = raw.split('.').next()?;
        match major {
            "1" => Some(ApiVersion::V1),
            "2" => Some(ApiVersion::V2),
            _ => None,
        }
    }

    /// Orders candidate versions newest-2.x-first, as
    /// `/api/api_version`'s response must be ranked against.
    pub fn preference_order() -> &'static [ApiVersion] {
        &[ApiVersion::V2, ApiVersion::V1]
    }
}

/// Whether a resource name belongs in the query string (v2) or a path
/// segment (v1).
pub fn names_in_query_string(version: ApiVersion) -> bool {
    version == ApiVersion::V2
}

/// The JSON field name used for a volume's provisioned size.
pub fn size_field_name(version: ApiVersion) -> &'static str {
    match version {
        ApiVersion::V2 => "provisioned",
        ApiVersion::V1 => "size",
    }
}

/// v2 wraps list responses in `{"items": [...]}`; v1 returns a bare array.
/// Both shapes deserialize through this into the same `Vec<T>`.
pub fn unwrap_collection<T: for<'de> Deserialize<'de>>(
    version: ApiVersion,
    body: Value,
) -> Result<Vec<T>, serde_json::Error> {
    match version {
        ApiVersion::V2 => {
            #[derive(Deserialize)]
            struct Items<T> {
                items: Vec<T>,
            }
            let wrapped: Items<T> = serde_json::from_value(body)?;
            Ok(wrapped.items)
        }
        ApiVersion::V1 => serde_json::from_value(body),
    }
}

/// Raw wire shape of an array volume, tolerant of either dialect's field
/// names via `serde(alias)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeWire {
    pub name: String,
    #[serde(alias = "size")]
    pub provisioned: u64,
    #[serde(default)]
    pub volumes: u64,
    pub serial: String,
    #[serde(default)]
    pub destroyed: bool,
    pub created: TimestampWire,
    #[serde(default)]
    pub pod: Option<PodWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PodWire {
    Name(String),
    Object { name: String },
}

impl PodWire {
    fn into_name(self) -> String {
        match self {
            PodWire::Name(n) => n,
            PodWire::Object { name } => name,
        }
    }
}

/// v1 reports `created` as epoch milliseconds; v2 as an ISO 8601 string.
/// Per the Open Question in spec.md §9, v2 timestamps with no explicit
/// offset are assumed UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampWire {
    EpochMillis(i64),
    Iso8601(String),
}

impl TimestampWire {
    pub fn into_datetime(self) -> DateTime<Utc> {
        match self {
            TimestampWire::EpochMillis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .unwrap_or_else(Utc::now),
            TimestampWire::Iso8601(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc.from_utc_datetime(&Utc::now().naive_utc())),
        }
    }
}

impl VolumeWire {
    pub fn into_array_volume(self) -> ArrayVolume {
        ArrayVolume {
            name: self.name,
            provisioned_bytes: self.provisioned,
            used_bytes: self.volumes,
            serial: self.serial.to_ascii_lowercase(),
            destroyed: self.destroyed,
            created: self.created.into_datetime(),
            pod: self.pod.map(PodWire::into_name),
        }
    }
}

/// Raw wire shape of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWire {
    pub name: String,
    pub source: String,
    pub created: TimestampWire,
    #[serde(default)]
    pub destroyed: bool,
}

impl SnapshotWire {
    pub fn into_array_snapshot(self) -> Option<ArraySnapshot> {
        let (_, suffix) = self.name.split_once('.')?;
        Some(ArraySnapshot {
            name: self.name.clone(),
            source_volume: self.source,
            suffix: suffix.to_owned(),
            created: self.created.into_datetime(),
            destroyed: self.destroyed,
        })
    }
}

/// Raw wire shape of a host object. v2 calls the field `iqns`/`wwns`
/// directly; v1 nests both under `initiators`-style keys historically, but
/// by the time this client was written both advertise the same flat shape,
/// so one struct covers both dialects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostWire {
    pub name: String,
    #[serde(default)]
    pub iqns: Vec<String>,
    #[serde(default)]
    pub wwns: Vec<String>,
}

impl HostWire {
    pub fn into_host(self) -> Host {
        Host {
            name: self.name,
            iqns: self.iqns,
            wwns: self.wwns,
        }
    }
}

/// Raw wire shape of array or pod space/capacity info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityWire {
    #[serde(alias = "capacity")]
    pub total: u64,
    #[serde(alias = "total_physical")]
    pub used: u64,
}

impl CapacityWire {
    pub fn into_capacity(self) -> Capacity {
        Capacity {
            total_bytes: self.total,
            used_bytes: self.used,
        }
    }
}

/// URL-escapes a `{pod}::{name}` qualified name exactly once for use in a
/// query string. Boundary test in spec.md §8: `::` must be escaped exactly
/// once, never double-escaped by a caller who already percent-encoded it.
pub fn escape_qualified_name(name: &str) -> String {
    url::form_urlencoded::byte_serialize(name.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_order_prefers_v2() {
        assert_eq!(ApiVersion::preference_order()[0], ApiVersion::V2);
    }

    #[test]
    fn parse_picks_major_version() {
        assert_eq!(ApiVersion::parse("2.23"), Some(ApiVersion::V2));
        assert_eq!(ApiVersion::parse("1.19"), Some(ApiVersion::V1));
        assert_eq!(ApiVersion::parse("3.0"), None);
    }

    #[test]
    fn unwraps_v2_items_collection() {
        let body = serde_json::json!({"items": [1, 2, 3]});
        let items: Vec<i32> = unwrap_collection(ApiVersion::V2, body).unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn unwraps_v1_bare_array() {
        let body = serde_json::json!([1, 2, 3]);
        let items: Vec<i32> = unwrap_collection(ApiVersion::V1, body).unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn escapes_double_colon_exactly_once() {
        let escaped = escape_qualified_name("pod1::pve-storage1-100-disk0");
        assert_eq!(escaped.matches("%3A%3A").count(), 1);
        assert!(!escaped.contains("::"));
    }

    #[test]
    fn epoch_millis_and_iso8601_both_parse() {
        let epoch = TimestampWire::EpochMillis(1_700_000_000_000).into_datetime();
        assert_eq!(epoch.to_rfc3339(), "2023-11-14T22:13:20+00:00");
        let iso = TimestampWire::Iso8601("2024-01-01T00:00:00Z".to_owned()).into_datetime();
        assert_eq!(iso.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn size_field_name_matches_dialect() {
        assert_eq!(size_field_name(ApiVersion::V2), "provisioned");
        assert_eq!(size_field_name(ApiVersion::V1), "size");
    }
}
