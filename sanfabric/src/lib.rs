//! Component C — SAN Fabric Driver (spec.md §4.C).
//!
//! Protocol-parameterized driver for the host kernel's SAN stack. `sanfabric`
//! and `devresolver` are the only two crates in this workspace that touch
//! the kernel; `arrayclient` is the only one that speaks HTTP.

pub mod common;
pub mod fc;
pub mod iscsi;
pub mod protocol;

pub use protocol::{FcProtocol, IscsiProtocol, Protocol};

use std::time::Duration;

/// Default timeout for any single subprocess this crate runs. Distinct from
/// the orchestrator's device-discovery deadline (spec.md's `device-timeout`
/// config option), which bounds a whole wait loop made of many of these.
pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);
