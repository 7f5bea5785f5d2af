//! Component E — Orchestrator (spec.md §4.E).
//!
//! Composes the four lower layers into the compound operations the host
//! platform's storage contract expects. This is the only crate in the
//! workspace that holds state spanning more than one call: the array
//! session (via `ArrayClient`) and the temp-clone tracking map (Design
//! Notes "Global/process state"), both scoped to one `Orchestrator`'s
//! lifetime rather than true process globals.

pub mod activation;
pub mod alloc;
pub mod clone_template;
pub mod config_backup;
pub mod free;
pub mod host_registration;
pub mod listing;
pub mod resize;
pub mod snapshot;
pub mod snapshot_access;

use std::collections::HashMap;
use std::sync::Mutex;

use arrayclient::ArrayClient;
use vol_api::config::PluginConfig;
use vol_api::error::OrchestratorError;

/// Identifies one tracked temporary clone by the triple that produced it
/// (spec.md §4.E "Snapshot access").
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) struct TempCloneKey {
    pub storage: String,
    pub volname: String,
    pub snap: String,
}

/// What the orchestrator needs to tear a temp clone back down later.
#[derive(Debug, Clone)]
pub(crate) struct TempCloneEntry {
    pub array_name: String,
}

/// Ties together the array session, this node's identity, and per-process
/// bookkeeping for temporary clones.
pub struct Orchestrator {
    pub(crate) config: PluginConfig,
    pub(crate) array: ArrayClient,
    pub(crate) node: String,
    pub(crate) temp_clones: Mutex<HashMap<TempCloneKey, TempCloneEntry>>,
}

impl Orchestrator {
    /// Builds an orchestrator for `node`, validating `config` and
    /// negotiating an array session eagerly (mirrors `ArrayClient::new`'s
    /// own eager login).
    pub fn new(config: PluginConfig, node: impl Into<String>) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let array = ArrayClient::new(&config)?;
        Ok(Orchestrator {
            config,
            array,
            node: node.into(),
            temp_clones: Mutex::new(HashMap::new()),
        })
    }

    /// The array-side host name this node registers under, per `host-mode`.
    pub fn host_name(&self) -> String {
        self.config.host_name(&self.node)
    }

    /// Prefixes `name` with this orchestrator's configured pod, if any.
    pub(crate) fn qualify(&self, name: &str) -> String {
        naming::qualify_pod(self.config.pod.as_deref(), name)
    }

    /// Assembles an orchestrator from already-built parts, bypassing the
    /// network login `new` performs. Used by submodule test suites that
    /// point `ArrayClient` at a `mockito` server via `with_base_url`.
    #[cfg(test)]
    pub(crate) fn for_testing(config: PluginConfig, array: ArrayClient, node: impl Into<String>) -> Self {
        Orchestrator {
            config,
            array,
            node: node.into(),
            temp_clones: Mutex::new(HashMap::new()),
        }
    }
}

/// Initializes the `log` backend. Idempotent: safe to call from every entry
/// point the host platform may invoke independently, since this crate has
/// no binary of its own and therefore no single `main` to call it from once.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
