//! Protocol polymorphism (Design Notes "Polymorphism over protocol").
//!
//! `Orchestrator` takes a `Box<dyn Protocol>` rather than branching on
//! `protocol == Protocol::Fc` at every call site that needs to log in,
//! rescan, or tear down a fabric connection.

use anyhow::Error;
use vol_api::config::Protocol as ProtocolKind;

use crate::{fc, iscsi};

/// A host-side transport capable of connecting this node to array-presented
/// volumes. Implemented once per spec.md `protocol` config value.
pub trait Protocol {
    /// Discovers and logs in to every portal/target this node should see.
    /// For iSCSI this is a real discovery+login sequence; for FC there is
    /// nothing to discover, so it degrades to a no-op.
    fn discover_and_login(&self, portals: &[(String, u16)]) -> Result<(), Error>;

    /// Asks the fabric to re-present any newly provisioned LUNs.
    fn rescan_fabric(&self) -> Result<(), Error>;

    /// Tears down sessions that are no longer needed. For iSCSI this logs
    /// out of targets; for FC it is a no-op (see [`fc::cleanup_sessions`]).
    fn cleanup_sessions(&self, iqns: &[String]) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IscsiProtocol;

impl Protocol for IscsiProtocol {
    fn discover_and_login(&self, portals: &[(String, u16)]) -> Result<(), Error> {
        for (portal, port) in portals {
            for target in iscsi::discover(portal, *port)? {
                iscsi::login(&target)?;
            }
        }
        Ok(())
    }

    fn rescan_fabric(&self) -> Result<(), Error> {
        iscsi::rescan_sessions()
    }

    fn cleanup_sessions(&self, iqns: &[String]) -> Result<(), Error> {
        let sessions = iscsi::sessions()?;
        for session in sessions {
            if iqns.iter().any(|iqn| iqn == &session.iqn) {
                iscsi::logout(&iscsi::DiscoveredTarget {
                    portal: session.portal,
                    port: session.port,
                    iqn: session.iqn,
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FcProtocol;

impl Protocol for FcProtocol {
    fn discover_and_login(&self, _portals: &[(String, u16)]) -> Result<(), Error> {
        // FC has no discovery/login handshake: zoning and LUN masking on the
        // array/switch side are what gate visibility, not a host action.
        Ok(())
    }

    fn rescan_fabric(&self) -> Result<(), Error> {
        fc::rescan_fabric()
    }

    fn cleanup_sessions(&self, _iqns: &[String]) -> Result<(), Error> {
        fc::cleanup_sessions()
    }
}

/// Builds the `Protocol` implementation matching a config value.
pub fn for_kind(kind: ProtocolKind) -> Box<dyn Protocol> {
    match kind {
        ProtocolKind::Iscsi => Box::new(IscsiProtocol),
        ProtocolKind::Fc => Box::new(FcProtocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_kind_selects_matching_impl() {
        // Smoke test only: discover_and_login with no portals must be a no-op
        // for both protocols, regardless of host environment.
        let iscsi = for_kind(ProtocolKind::Iscsi);
        assert!(iscsi.discover_and_login(&[]).is_ok());
        let fc = for_kind(ProtocolKind::Fc);
        assert!(fc.discover_and_login(&[]).is_ok());
    }
}
