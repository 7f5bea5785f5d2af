//! Device-appear wait loop (spec.md §4.D "Wait loop").

use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::Error;
use log::{info, warn};
use vol_api::error::DeviceError;

use crate::{diagnostic::Diagnostic, lookup, ResolvedDevice, WAIT_POLL_INTERVAL};

/// Waits up to `timeout` for `wwid` to resolve to a local block device.
/// Each iteration: run `rescan_fabric` (the protocol-specific callback,
/// iSCSI session rescan or FC LIP), rescan every SCSI host, reload
/// multipath, trigger udev, then retry the lookup.
pub fn wait_for_device(
    wwid: &str,
    timeout: Duration,
    rescan_fabric: impl Fn() -> Result<(), Error>,
) -> Result<ResolvedDevice, DeviceError> {
    let deadline = Instant::now() + timeout;
    info!("Waiting up to {timeout:?} for wwid {wwid} to appear");

    loop {
        if let Err(e) = rescan_fabric() {
            warn!("Fabric rescan failed while waiting for {wwid}: {e}");
        }
        if let Err(e) = sanfabric::common::rescan_scsi_hosts() {
            warn!("SCSI host rescan failed while waiting for {wwid}: {e}");
        }
        if let Err(e) = sanfabric::common::multipath_reconfigure() {
            warn!("multipath reconfigure failed while waiting for {wwid}: {e}");
        }
        if let Err(e) = sanfabric::common::udev_trigger_and_settle() {
            warn!("udev trigger/settle failed while waiting for {wwid}: {e}");
        }

        if let Some(resolved) = lookup::resolve_wwid(wwid)? {
            info!("wwid {wwid} resolved to {}", resolved.path);
            return Ok(resolved);
        }

        if Instant::now() >= deadline {
            let diagnostic = Diagnostic::collect().unwrap_or_default();
            return Err(DeviceError::DiscoveryTimeout {
                wwid: wwid.to_owned(),
                timeout_secs: timeout.as_secs(),
                diagnostic: diagnostic.render(),
            });
        }

        thread::sleep(WAIT_POLL_INTERVAL);
    }
}
