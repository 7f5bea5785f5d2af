//! Structured discovery-failure diagnostics (spec.md §7 "Local-side fatal").
//!
//! A bare error string forces the orchestrator to string-match its own
//! lower layer's output to render anything useful; this struct is built
//! once, at the point of failure, and rendered consistently everywhere a
//! `DeviceError::DiscoveryTimeout` is reported to the host platform.

use anyhow::Error;

/// A snapshot of fabric state taken at the moment a device-wait gave up,
/// plus the commands an operator would run next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub active_iscsi_sessions: Vec<String>,
    pub online_fc_targets: Vec<String>,
    pub suggested_commands: Vec<String>,
}

impl Diagnostic {
    /// Collects best-effort fabric state. Never fails the caller: any
    /// sub-collection that errors is simply omitted, since this runs on an
    /// already-failing path and must not itself become the new failure.
    pub fn collect() -> Result<Diagnostic, Error> {
        let active_iscsi_sessions = sanfabric::iscsi::sessions()
            .map(|sessions| {
                sessions
                    .into_iter()
                    .map(|s| format!("{}:{} {}", s.portal, s.port, s.iqn))
                    .collect()
            })
            .unwrap_or_default();

        let online_fc_targets = sanfabric::fc::remote_ports()
            .map(|ports| {
                ports
                    .into_iter()
                    .filter(|p| p.is_target)
                    .map(|p| p.port_name)
                    .collect()
            })
            .unwrap_or_default();

        let suggested_commands = vec![
            "iscsiadm -m session".to_owned(),
            "multipathd show maps raw format \"%n %w\"".to_owned(),
            "multipathd show paths".to_owned(),
            "cat /sys/class/fc_host/host*/port_state".to_owned(),
        ];

        Ok(Diagnostic {
            active_iscsi_sessions,
            online_fc_targets,
            suggested_commands,
        })
    }

    /// Flattens the diagnostic into the text block `DeviceError::DiscoveryTimeout`
    /// carries.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out += "active iSCSI sessions:\n";
        if self.active_iscsi_sessions.is_empty() {
            out += "  (none)\n";
        }
        for session in &self.active_iscsi_sessions {
            out += &format!("  {session}\n");
        }
        out += "online FC target ports:\n";
        if self.online_fc_targets.is_empty() {
            out += "  (none)\n";
        }
        for target in &self.online_fc_targets {
            out += &format!("  {target}\n");
        }
        out += "debug commands to run:\n";
        for cmd in &self.suggested_commands {
            out += &format!("  {cmd}\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_shows_placeholder_when_empty() {
        let diag = Diagnostic::default();
        let rendered = diag.render();
        assert!(rendered.contains("active iSCSI sessions"));
        assert!(rendered.contains("(none)"));
    }

    #[test]
    fn render_lists_sessions_and_targets() {
        let diag = Diagnostic {
            active_iscsi_sessions: vec!["10.0.0.1:3260 iqn.test".to_owned()],
            online_fc_targets: vec!["21000024ff5a1b2c".to_owned()],
            suggested_commands: vec!["iscsiadm -m session".to_owned()],
        };
        let rendered = diag.render();
        assert!(rendered.contains("iqn.test"));
        assert!(rendered.contains("21000024ff5a1b2c"));
    }
}
