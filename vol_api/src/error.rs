//! Typed error taxonomy (spec.md §7).
//!
//! Lower layers classify and annotate; only the orchestrator decides retry
//! vs. surface. String-matching on external error text is confined to one
//! adapter per external system and must not leak past these types.

use thiserror::Error;

/// Errors surfaced by the Array Client's transport/dialect layer.
#[derive(Debug, Error)]
pub enum ArrayError {
    /// Transient transport failure: 429, 5xx (except non-idempotent POST), or
    /// a connection reset. The caller may retry with backoff.
    #[error("transient array error ({status}): {message}")]
    Transient { status: u16, message: String },

    /// 401 after a session was already established; the caller should
    /// invalidate the session, re-authenticate, and retry once.
    #[error("array session expired: {message}")]
    AuthExpired { message: String },

    /// 404 / "does not exist". Callers doing a `get` should treat this as
    /// "not present"; callers doing a destructive op should treat it as
    /// idempotent success.
    #[error("array object not found: {message}")]
    NotFound { message: String },

    /// 409 / "already exists" / "in use" / "has dependent volume", etc.
    /// `code` carries the array's structured `errors[].code` when the v2
    /// dialect supplies one; matching on it is preferred over `message`.
    #[error("array conflict: {message}")]
    Conflict {
        message: String,
        code: Option<String>,
        hint: Option<&'static str>,
    },

    /// Any other non-retryable 4xx, with a hint appended where one applies
    /// (401/403/404/409/quota/capacity/503 per spec.md §4.B).
    #[error("array request failed: {message}")]
    Rejected { status: u16, message: String },

    /// Transport-level failure with no HTTP response at all.
    #[error("failed to reach array: {0}")]
    Transport(String),

    /// Neither dialect the client understands could be negotiated.
    #[error("could not negotiate a supported API version")]
    VersionNegotiationFailed,
}

impl ArrayError {
    /// True for conflict messages that are benign from the orchestrator's
    /// point of view: a peer (or our own retry) already did the thing.
    pub fn is_benign_conflict(&self) -> bool {
        matches!(self, ArrayError::Conflict { message, .. }
            if contains_any(message, &["already exists", "already connected", "already in use"]))
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_ascii_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Errors surfaced by the SAN Fabric Driver and Device Resolver: local-side
/// fatal conditions that are never retried by the lower layer itself.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device for wwid {wwid} did not appear within {timeout_secs}s\n{diagnostic}")]
    DiscoveryTimeout {
        wwid: String,
        timeout_secs: u64,
        diagnostic: String,
    },

    #[error("device {device} is still in use: {reason}")]
    InUse { device: String, reason: String },

    #[error("subprocess '{command}' failed: {message}")]
    SubprocessFailed { command: String, message: String },

    #[error("subprocess '{command}' timed out after {timeout_secs}s")]
    SubprocessTimeout { command: String, timeout_secs: u64 },

    #[error("refusing unsafe device name '{0}'")]
    UnsafeDeviceName(String),
}

/// Errors surfaced by `naming`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("'{0}' is not a recognized host-side volume name")]
    UnrecognizedVolname(String),

    #[error("'{0}' is not a valid array object name")]
    InvalidArrayName(String),

    #[error("disk index scan exhausted 0..999 for vmid {0}")]
    DiskIndexExhausted(u32),
}

/// Top-level orchestrator error: composes the lower-layer taxonomies plus
/// operation-specific conditions spec.md §4.E calls out by name.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Array(#[from] ArrayError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("volume '{0}' already exists and cannot be reused")]
    VolumeNameInUse(String),

    #[error("host registration conflict: initiator '{initiator}' is already registered to a different host ('{other_host}'); an administrator must remove it there first")]
    InitiatorConflict {
        initiator: String,
        other_host: String,
    },

    #[error("snapshot '{snapshot}' has dependent clones; remove them before deleting")]
    SnapshotHasDependents { snapshot: String },

    #[error("cannot shrink volume '{0}'")]
    ShrinkNotAllowed(String),

    #[error("cross-pod overwrite is not supported ({source_pod:?} -> {target_pod:?})")]
    CrossPodOverwrite {
        source_pod: Option<String>,
        target_pod: Option<String>,
    },

    #[error("invalid plugin configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}
