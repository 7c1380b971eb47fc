//! Cluster plane configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of the cluster plane on one node
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// How often the peer finder requests fresh seed addresses, in ms
    #[serde(default = "default_find_peers_interval")]
    pub find_peers_interval_ms: u64,

    /// Outgoing probe connection timeout, in ms
    #[serde(default = "default_probe_connect_timeout")]
    pub probe_connect_timeout_ms: u64,

    /// Per-round timeout of a peers request, in ms
    #[serde(default = "default_request_peers_timeout")]
    pub request_peers_timeout_ms: u64,

    /// Retries of temporary errors on the write path
    #[serde(default = "default_temp_error_retries")]
    pub temp_error_retries: u32,

    /// How long a close waits for newly closed indices to report an active
    /// shard, in ms
    #[serde(default = "default_close_ack_timeout")]
    pub close_ack_timeout_ms: u64,

    /// Awareness attributes used by routing and allocation
    #[serde(default)]
    pub awareness_attributes: Vec<String>,
}

fn default_find_peers_interval() -> u64 {
    1_000
}

fn default_probe_connect_timeout() -> u64 {
    30_000
}

fn default_request_peers_timeout() -> u64 {
    3_000
}

fn default_temp_error_retries() -> u32 {
    3
}

fn default_close_ack_timeout() -> u64 {
    30_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            find_peers_interval_ms: default_find_peers_interval(),
            probe_connect_timeout_ms: default_probe_connect_timeout(),
            request_peers_timeout_ms: default_request_peers_timeout(),
            temp_error_retries: default_temp_error_retries(),
            close_ack_timeout_ms: default_close_ack_timeout(),
            awareness_attributes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn find_peers_interval(&self) -> Duration {
        Duration::from_millis(self.find_peers_interval_ms)
    }

    pub fn probe_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_connect_timeout_ms)
    }

    pub fn request_peers_timeout(&self) -> Duration {
        Duration::from_millis(self.request_peers_timeout_ms)
    }

    pub fn close_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.close_ack_timeout_ms)
    }
}
