//! Plugin configuration (spec.md §6 "Configuration (recognized options)").
//!
//! The host plugin interface that loads these options from its own storage
//! configuration format is out of scope (spec.md §1); this struct is the
//! stable contract it is expected to populate, the same way
//! `trident_api::config` centralizes typed configuration that Trident's CLI
//! layer merely loads and hands off.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

pub const DEVICE_TIMEOUT_MIN: u64 = 10;
pub const DEVICE_TIMEOUT_MAX: u64 = 300;
pub const DEVICE_TIMEOUT_DEFAULT: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Iscsi,
    Fc,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Iscsi
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostMode {
    PerNode,
    Shared,
}

impl Default for HostMode {
    fn default() -> Self {
        HostMode::PerNode
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    ApiToken {
        #[serde(rename = "api-token")]
        api_token: String,
    },
    UserPass { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub portal: String,
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default, rename = "ssl-verify")]
    pub ssl_verify: bool,
    #[serde(default, rename = "protocol")]
    pub protocol: Protocol,
    #[serde(default, rename = "host-mode")]
    pub host_mode: HostMode,
    #[serde(default = "default_cluster_name", rename = "cluster-name")]
    pub cluster_name: String,
    #[serde(default = "default_device_timeout", rename = "device-timeout")]
    pub device_timeout_secs: u64,
    #[serde(default, rename = "pod")]
    pub pod: Option<String>,
}

fn default_cluster_name() -> String {
    "pve".to_owned()
}

fn default_device_timeout() -> u64 {
    DEVICE_TIMEOUT_DEFAULT
}

impl PluginConfig {
    /// Builds and validates a config from the raw string option map the host
    /// plugin interface hands in.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, OrchestratorError> {
        let json = serde_json::to_value(options)
            .map_err(|e| OrchestratorError::Config(format!("could not encode options: {e}")))?;
        let config: PluginConfig = serde_json::from_value(json)
            .map_err(|e| OrchestratorError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.portal.trim().is_empty() {
            return Err(OrchestratorError::Config("portal is required".into()));
        }
        if !(DEVICE_TIMEOUT_MIN..=DEVICE_TIMEOUT_MAX).contains(&self.device_timeout_secs) {
            return Err(OrchestratorError::Config(format!(
                "device-timeout must be between {DEVICE_TIMEOUT_MIN} and {DEVICE_TIMEOUT_MAX}, got {}",
                self.device_timeout_secs
            )));
        }
        if let Credentials::UserPass { username, password } = &self.credentials {
            if username.trim().is_empty() || password.trim().is_empty() {
                return Err(OrchestratorError::Config(
                    "username and password must both be non-empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// The host name this node would register as, per host-mode.
    pub fn host_name(&self, node: &str) -> String {
        match self.host_mode {
            HostMode::PerNode => format!("pve-{}-{}", self.cluster_name, node),
            HostMode::Shared => format!("pve-{}-shared", self.cluster_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_minimal_api_token_config() {
        let cfg = PluginConfig::from_options(&opts(&[
            ("portal", "10.0.0.1"),
            ("api-token", "secret"),
        ]))
        .unwrap();
        assert_eq!(cfg.portal, "10.0.0.1");
        assert_eq!(cfg.cluster_name, "pve");
        assert_eq!(cfg.device_timeout_secs, DEVICE_TIMEOUT_DEFAULT);
        assert_eq!(cfg.protocol, Protocol::Iscsi);
        assert_eq!(cfg.host_mode, HostMode::PerNode);
    }

    #[test]
    fn accepts_hyphenated_api_token_key() {
        let cfg = PluginConfig::from_options(&opts(&[
            ("portal", "10.0.0.1"),
            ("api-token", "secret"),
        ]))
        .unwrap();
        assert_eq!(cfg.credentials, Credentials::ApiToken { api_token: "secret".to_owned() });
    }

    #[test]
    fn underscored_api_token_key_is_not_recognized() {
        // `api_token` (underscore) is not the recognized option key; serde
        // never translates `_`<->`-`, so this falls through the untagged
        // `Credentials` enum to `UserPass` and fails validation there.
        let cfg = PluginConfig::from_options(&opts(&[
            ("portal", "10.0.0.1"),
            ("api_token", "secret"),
        ]));
        assert!(cfg.is_err());
    }

    #[test]
    fn rejects_out_of_range_device_timeout() {
        let cfg = PluginConfig::from_options(&opts(&[
            ("portal", "10.0.0.1"),
            ("api-token", "secret"),
            ("device-timeout", "5"),
        ]));
        assert!(cfg.is_err());
    }

    #[test]
    fn host_name_reflects_mode() {
        let mut cfg = PluginConfig::from_options(&opts(&[
            ("portal", "10.0.0.1"),
            ("api-token", "secret"),
            ("cluster-name", "mycluster"),
        ]))
        .unwrap();
        assert_eq!(cfg.host_name("node1"), "pve-mycluster-node1");
        cfg.host_mode = HostMode::Shared;
        assert_eq!(cfg.host_name("node1"), "pve-mycluster-shared");
    }
}
