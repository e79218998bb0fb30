//! Server configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables of a [`crate::Server`]. Missing fields take their defaults.
///
/// ```json
/// { "tick_interval_ms": 1000, "probe_expiring_keys": true }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Period of the expiry ticker.
    pub tick_interval_ms: u64,
    /// Ask the backend for the real ttl of keys whose countdown ran out.
    pub probe_expiring_keys: bool,
    /// Name of the connection's worker thread.
    pub worker_thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            tick_interval_ms: 1000,
            probe_expiring_keys: true,
            worker_thread_name: "kvbridge-worker".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// The tick period, at least one millisecond.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
