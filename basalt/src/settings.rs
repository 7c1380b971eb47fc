//! Typed, scope-tagged settings
//!
//! A setting definition carries its name, scope, default and flags; values
//! live in a plain map and are decoded on access. Dynamic settings may
//! change at runtime and propagate via cluster state; everything else is
//! fixed at node startup. The core depends on these settings by semantics,
//! not by name.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Where a setting applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingScope {
    /// Per-node configuration
    Node,
    /// Per-index configuration
    Index,
}

/// Definition of one setting
#[derive(Debug, Clone, Copy)]
pub struct Setting<T: 'static> {
    pub name: &'static str,
    pub scope: SettingScope,
    /// May be changed at runtime via a cluster-state update
    pub dynamic: bool,
    /// Shown in the exposed settings table
    pub exposed: bool,
    default: fn() -> T,
}

impl<T> Setting<T> {
    pub const fn new(
        name: &'static str,
        scope: SettingScope,
        dynamic: bool,
        exposed: bool,
        default: fn() -> T,
    ) -> Self {
        Self {
            name,
            scope,
            dynamic,
            exposed,
            default,
        }
    }

    pub fn default_value(&self) -> T {
        (self.default)()
    }
}

/// Awareness attributes routing and allocation spread copies across
pub static AWARENESS_ATTRIBUTES: Setting<Vec<String>> = Setting::new(
    "cluster.routing.allocation.awareness.attributes",
    SettingScope::Node,
    true,
    true,
    Vec::new,
);

/// How often the peer finder asks for fresh seed addresses
pub static DISCOVERY_FIND_PEERS_INTERVAL_MS: Setting<u64> = Setting::new(
    "discovery.find_peers_interval",
    SettingScope::Node,
    false,
    true,
    || 1_000,
);

/// Outgoing probe connection timeout
pub static DISCOVERY_PROBE_CONNECT_TIMEOUT_MS: Setting<u64> = Setting::new(
    "discovery.probe.connect_timeout",
    SettingScope::Node,
    false,
    true,
    || 30_000,
);

/// How long a close waits for each index to report an active shard
pub static CLOSE_ACK_TIMEOUT_MS: Setting<u64> = Setting::new(
    "cluster.table.close.ack_timeout",
    SettingScope::Node,
    true,
    true,
    || 30_000,
);

/// Retries of temporary errors on the write path
pub static TEMP_ERROR_RETRIES: Setting<u32> = Setting::new(
    "bulk.temp_error_retries",
    SettingScope::Node,
    true,
    true,
    || 3,
);

/// Node data directory
pub static PATH_DATA: Setting<String> = Setting::new(
    "path.data",
    SettingScope::Node,
    false,
    true,
    || "data".to_string(),
);

/// Node log directory
pub static PATH_LOGS: Setting<String> = Setting::new(
    "path.logs",
    SettingScope::Node,
    false,
    true,
    || "logs".to_string(),
);

/// Snapshot repository root
pub static PATH_REPO: Setting<String> = Setting::new(
    "path.repo",
    SettingScope::Node,
    false,
    true,
    || "repo".to_string(),
);

/// A bag of setting values, keyed by setting name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: BTreeMap<String, Value>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value; the caller supplies the matching type
    pub fn put<T: Serialize>(&mut self, setting: &Setting<T>, value: T) -> &mut Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.values.insert(setting.name.to_string(), value);
        }
        self
    }

    /// Read a setting, falling back to its default when unset or mistyped
    pub fn get<T: DeserializeOwned>(&self, setting: &Setting<T>) -> T {
        self.values
            .get(setting.name)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| setting.default_value())
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}
