//! Runtime configuration
//!
//! One immutable struct threaded through the data store and the web
//! layer; there are no process-wide mutable flags.

use std::path::PathBuf;

/// Server-wide configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one sled database per collection
    pub data_dir: PathBuf,
    /// Mount the access-control endpoints and evaluate rules at query time
    pub experimental_access_control: bool,
    /// This node replicates from an upstream primary
    pub is_secondary: bool,
    /// Allow local writes even when running as a secondary
    pub accepts_writes: bool,
    /// Deny access checks that no rule matched
    pub default_deny: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            experimental_access_control: false,
            is_secondary: false,
            accepts_writes: false,
            default_deny: false,
        }
    }
}

impl Config {
    /// Whether ingest and delete requests may mutate this node.
    pub fn accepts_local_writes(&self) -> bool {
        !self.is_secondary || self.accepts_writes
    }
}
