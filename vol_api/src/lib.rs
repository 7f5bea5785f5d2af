pub mod config;
pub mod error;
pub mod types;
pub mod wwid;

/// Identifier for a cluster node the plugin is running on.
pub type NodeName = String;
