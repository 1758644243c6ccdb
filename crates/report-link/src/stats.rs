use serde::{Deserialize, Serialize};

use crate::net::interface::TransportKind;
use crate::scheduler::{Priority, Quality, Stat};

pub const SNAPSHOT_SCHEMA_VERSION: i32 = 1;

/// Per-server state for JSON serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub address: String,
    pub priority: Priority,
    pub quality: Quality,
    pub rank: u8,
    pub activated: bool,
    pub ready: bool,
    /// Cumulative "all types" counters; absent until the server carried a report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
}

/// Point-in-time view of the link layer, servers listed in rank order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub schema_version: i32,
    pub transport: TransportKind,
    pub aggregate_quality: Quality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Stat>,
    /// Correlation records still awaiting eviction in the aggregate ledger.
    pub outstanding: usize,
    pub servers: Vec<ServerSnapshot>,
}

impl Default for LinkSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            transport: TransportKind::default(),
            aggregate_quality: Quality::default(),
            aggregate: None,
            outstanding: 0,
            servers: Vec::new(),
        }
    }
}

impl LinkSnapshot {
    pub fn ready_count(&self) -> usize {
        self.servers.iter().filter(|s| s.ready).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
