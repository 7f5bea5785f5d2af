//! iSCSI session management (spec.md §4.C "iSCSI").

use std::{fs, path::Path, process::Command};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use crate::SUBPROCESS_TIMEOUT;

const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// `iscsiadm -m discovery -t sendtargets` login exits 15 when the session is
/// already logged in; that is success, not failure.
const ISCSIADM_ALREADY_LOGGED_IN: i32 = 15;

/// One discovered iSCSI portal/target pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTarget {
    pub portal: String,
    pub port: u16,
    pub iqn: String,
}

/// One active iSCSI session, as reported by `iscsiadm -m session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub portal: String,
    pub port: u16,
    pub iqn: String,
}

/// Reads the node's local initiator IQN from `InitiatorName=` in
/// `/etc/iscsi/initiatorname.iscsi`.
pub fn local_iqn() -> Result<String, Error> {
    local_iqn_from(Path::new(INITIATOR_NAME_FILE))
}

fn local_iqn_from(path: &Path) -> Result<String, Error> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    parse_initiator_name(&contents)
        .with_context(|| format!("No InitiatorName found in '{}'", path.display()))
}

fn parse_initiator_name(contents: &str) -> Result<String, Error> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName=").map(str::to_owned))
        .context("InitiatorName= line not found")
}

/// Writes a new local initiator IQN. Used only via an explicit setter, never
/// implicitly by the discovery/login path.
pub fn set_local_iqn(iqn: &str) -> Result<(), Error> {
    fs::write(INITIATOR_NAME_FILE, format!("InitiatorName={iqn}\n"))
        .with_context(|| format!("Failed to write '{INITIATOR_NAME_FILE}'"))
}

/// `iscsiadm -m discovery -t sendtargets -p {portal}:{port}`.
pub fn discover(portal: &str, port: u16) -> Result<Vec<DiscoveredTarget>, Error> {
    info!("Discovering iSCSI targets on {portal}:{port}");
    let out = procrun::run_checked(
        Command::new("iscsiadm")
            .arg("-m")
            .arg("discovery")
            .arg("-t")
            .arg("sendtargets")
            .arg("-p")
            .arg(format!("{portal}:{port}")),
        SUBPROCESS_TIMEOUT,
    )
    .with_context(|| format!("Failed to discover targets on {portal}:{port}"))?;
    Ok(parse_discovery(&out.stdout))
}

fn parse_discovery(raw: &str) -> Vec<DiscoveredTarget> {
    // Lines look like: "10.0.0.1:3260,1 iqn.2010-06.com.example:array1"
    raw.lines()
        .filter_map(|line| {
            let (endpoint, iqn) = line.split_once(' ')?;
            let endpoint = endpoint.split(',').next()?;
            let (portal, port) = endpoint.rsplit_once(':')?;
            Some(DiscoveredTarget {
                portal: portal.to_owned(),
                port: port.parse().ok()?,
                iqn: iqn.trim().to_owned(),
            })
        })
        .collect()
}

/// Logs in to a specific target. Exit code 15 ("already logged in") is
/// treated as success.
pub fn login(target: &DiscoveredTarget) -> Result<(), Error> {
    info!("Logging in to iSCSI target {} at {}:{}", target.iqn, target.portal, target.port);
    procrun::run(
        Command::new("iscsiadm")
            .arg("-m")
            .arg("node")
            .arg("-T")
            .arg(&target.iqn)
            .arg("-p")
            .arg(format!("{}:{}", target.portal, target.port))
            .arg("--login"),
        SUBPROCESS_TIMEOUT,
        |out| out.exit_code() == Some(ISCSIADM_ALREADY_LOGGED_IN),
    )
    .with_context(|| format!("Failed to log in to target '{}'", target.iqn))?;
    Ok(())
}

/// Logs out of a specific target.
pub fn logout(target: &DiscoveredTarget) -> Result<(), Error> {
    info!("Logging out of iSCSI target {}", target.iqn);
    procrun::run_checked(
        Command::new("iscsiadm")
            .arg("-m")
            .arg("node")
            .arg("-T")
            .arg(&target.iqn)
            .arg("-p")
            .arg(format!("{}:{}", target.portal, target.port))
            .arg("--logout"),
        SUBPROCESS_TIMEOUT,
    )
    .with_context(|| format!("Failed to log out of target '{}'", target.iqn))?;
    Ok(())
}

/// Lists active sessions (`iscsiadm -m session`).
pub fn sessions() -> Result<Vec<Session>, Error> {
    let out = procrun::run(
        Command::new("iscsiadm").arg("-m").arg("session"),
        SUBPROCESS_TIMEOUT,
        // "No active sessions" exits non-zero; that is an empty list, not an error.
        |out| out.stderr.to_lowercase().contains("no active sessions"),
    )
    .context("Failed to list iSCSI sessions")?;
    Ok(parse_sessions(&out.stdout))
}

fn parse_sessions(raw: &str) -> Vec<Session> {
    // "tcp: [1] 10.0.0.1:3260,1 iqn.2010-06.com.example:array1 (non-flash)"
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            fields.next()?; // "tcp:"
            fields.next()?; // "[1]"
            let endpoint = fields.next()?;
            let iqn = fields.next()?;
            let endpoint = endpoint.split(',').next()?;
            let (portal, port) = endpoint.rsplit_once(':')?;
            Some(Session {
                portal: portal.to_owned(),
                port: port.parse().ok()?,
                iqn: iqn.to_owned(),
            })
        })
        .collect()
}

/// Rescans every active session (no target filter).
pub fn rescan_sessions() -> Result<(), Error> {
    rescan(None)
}

/// Rescans a single target's session.
pub fn rescan_target(iqn: &str) -> Result<(), Error> {
    rescan(Some(iqn))
}

fn rescan(iqn: Option<&str>) -> Result<(), Error> {
    let mut cmd = Command::new("iscsiadm");
    cmd.arg("-m").arg("session").arg("--rescan");
    if let Some(iqn) = iqn {
        cmd.arg("-T").arg(iqn);
    }
    match procrun::run_checked(&mut cmd, SUBPROCESS_TIMEOUT) {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("iSCSI session rescan failed: {e}");
            Err(e)
        }
    }
    .context("Failed to rescan iSCSI session(s)")?;
    debug!("iSCSI session rescan complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_initiator_name_ignoring_comments() {
        let contents = "## generated\n#InitiatorName=old\nInitiatorName=iqn.1993-08.org.debian:01:abc\n";
        assert_eq!(
            parse_initiator_name(contents).unwrap(),
            "iqn.1993-08.org.debian:01:abc"
        );
    }

    #[test]
    fn parses_discovery_output() {
        let raw = "10.0.0.1:3260,1 iqn.2010-06.com.example:array1\n10.0.0.2:3260,1 iqn.2010-06.com.example:array1\n";
        let targets = parse_discovery(raw);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].portal, "10.0.0.1");
        assert_eq!(targets[0].port, 3260);
        assert_eq!(targets[0].iqn, "iqn.2010-06.com.example:array1");
    }

    #[test]
    fn parses_session_listing() {
        let raw = "tcp: [1] 10.0.0.1:3260,1 iqn.2010-06.com.example:array1 (non-flash)\n";
        let sessions = parse_sessions(raw);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].iqn, "iqn.2010-06.com.example:array1");
        assert_eq!(sessions[0].port, 3260);
    }
}
