//! Configuration types for the messaging core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time to wait for a response before giving up.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Default capacity of per-connection message channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Tunables shared by the correlation engine, RPC helper and transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// How long a caller waits for a response, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// How long a delivered response stays buffered for a late waiter, in milliseconds.
    pub response_buffer_ms: u64,
    /// Capacity of each in-process connection channel.
    pub channel_capacity: usize,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT.as_millis() as u64,
            response_buffer_ms: DEFAULT_RPC_TIMEOUT.as_millis() as u64,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

impl MeshConfig {
    pub fn rpc_timeout(&self) -> Duration {
        normalize_timeout(Duration::from_millis(self.rpc_timeout_ms))
    }

    pub fn response_buffer(&self) -> Duration {
        normalize_timeout(Duration::from_millis(self.response_buffer_ms))
    }
}

/// Replace a zero timeout with [`DEFAULT_RPC_TIMEOUT`]. Waits are never unbounded.
pub fn normalize_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_RPC_TIMEOUT
    } else {
        timeout
    }
}
