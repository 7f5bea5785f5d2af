//! Host registration (spec.md §4.E "Host registration").

use log::info;
use vol_api::error::{ArrayError, OrchestratorError};
use vol_api::types::Host;

use crate::Orchestrator;

impl Orchestrator {
    /// Get-or-creates this node's host object and ensures every one of
    /// `initiators` is registered to it, tolerating a race with a peer node
    /// creating the same host concurrently (`get_or_create_host` already
    /// absorbs that). `is_wwn` selects the IQN vs. WWN list.
    ///
    /// `Host::has_initiator` is checked before every add, so a remaining
    /// `Conflict` from the array can only mean the initiator is already
    /// registered to a *different* host — that case is fatal and
    /// actionable, not something `ArrayError::is_benign_conflict` should
    /// paper over.
    pub fn ensure_host_registered(&self, initiators: &[String], is_wwn: bool) -> Result<Host, OrchestratorError> {
        let name = self.host_name();
        let mut host = self.array.get_or_create_host(&name)?;

        for initiator in initiators {
            if host.has_initiator(initiator) {
                continue;
            }
            if let Err(e) = self.array.add_initiator(&name, initiator, is_wwn) {
                return Err(into_registration_error(initiator, e));
            }
            info!("Registered initiator '{initiator}' to host '{name}'");
        }

        host = self.array.get_host(&name)?.ok_or_else(|| {
            OrchestratorError::Other(format!("host '{name}' vanished immediately after registration"))
        })?;
        Ok(host)
    }
}

fn into_registration_error(initiator: &str, err: ArrayError) -> OrchestratorError {
    match err {
        ArrayError::Conflict { .. } => OrchestratorError::InitiatorConflict {
            initiator: initiator.to_owned(),
            other_host: extract_conflicting_host(&err).unwrap_or_else(|| "an unknown host".to_owned()),
        },
        other => other.into(),
    }
}

/// Best-effort extraction of a conflicting host's name from the array's
/// (unspecified-format) error message, e.g. "... already in use by host
/// 'pve-pve-node2' ...". Falls back to a generic placeholder when no
/// recognizable host name can be pulled out.
fn extract_conflicting_host(err: &ArrayError) -> Option<String> {
    let message = err.to_string();
    for marker in ["host '", "host \""] {
        if let Some(idx) = message.find(marker) {
            let rest = &message[idx + marker.len()..];
            if let Some(end) = rest.find(['\'', '"']) {
                return Some(rest[..end].to_owned());
            }
        }
    }
    None
}
