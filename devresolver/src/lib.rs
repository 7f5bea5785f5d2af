//! Component D — Device Resolver (spec.md §4.D).
//!
//! Binds array-side WWIDs to local block devices. `sanfabric` and
//! `devresolver` are the only two crates in this workspace that touch the
//! kernel; this one owns everything downstream of a rescan: lookup, the
//! device-appear wait loop, in-use detection, and teardown.

pub mod diagnostic;
pub mod inuse;
pub mod lookup;
pub mod teardown;
pub mod wait;

pub use diagnostic::Diagnostic;
pub use lookup::ResolvedDevice;
pub use wait::wait_for_device;

use std::time::Duration;

/// Interval between iterations of [`wait::wait_for_device`]'s poll loop.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interval device-mapper and the kernel are given to settle mid-teardown.
pub const TEARDOWN_SETTLE_INTERVAL: Duration = Duration::from_millis(500);
