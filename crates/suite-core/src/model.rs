//! Shared data model: facts, semantic facts, module manifests/runtime records,
//! events, context bundles, and sync envelopes. See spec §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// `(user, key)` is unique. `confidence` is clamped to `[0, 1]` on construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub user: String,
    pub key: String,
    pub value: String,
    pub confidence: f32,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(user: &str, key: &str, value: &str, confidence: f32, category: &str, now: DateTime<Utc>) -> Self {
        Self {
            user: user.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            category: category.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A fact promoted for semantic retrieval. One `id` is immutable; revisions get a new `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticFact {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub key: String,
    pub confidence: f32,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

/// `{"ports": {"api": 5000}}` in `module_info.json` (spec §6). `api` is the
/// only port role the fabric currently reads.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PortsSection {
    #[serde(default)]
    pub api: Option<u16>,
}

/// `module_info.json`. See spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub module_id: String,
    pub name: String,
    pub version: String,
    /// Flat legacy form, kept for manifests that predate the nested
    /// `ports.api` schema. `effective_requested_port()` prefers `ports.api`.
    #[serde(default)]
    pub requested_port: Option<u16>,
    #[serde(default)]
    pub ports: Option<PortsSection>,
    pub entry_point: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub declared_endpoints: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_health_route")]
    pub health_route: String,
}

impl ModuleManifest {
    /// Reads the requested port per spec §6: `ports.api` takes precedence
    /// over the flat `requested_port` field.
    pub fn effective_requested_port(&self) -> Option<u16> {
        self.ports.as_ref().and_then(|p| p.api).or(self.requested_port)
    }
}

fn default_health_route() -> String {
    "/health".to_string()
}

/// Lifecycle state of a module's runtime record. See spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Registered,
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleState::Registered => "registered",
            ModuleState::Starting => "starting",
            ModuleState::Healthy => "healthy",
            ModuleState::Degraded => "degraded",
            ModuleState::Unhealthy => "unhealthy",
            ModuleState::Stopping => "stopping",
            ModuleState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// `(module_id, assigned_port, ..., state)`. The process handle itself lives
/// only inside the registry (it is not `Serialize`); this is the public,
/// snapshot-safe view of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRuntimeRecord {
    pub module_id: String,
    pub assigned_port: Option<u16>,
    pub state: ModuleState,
    pub last_health: Option<String>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ModuleRuntimeRecord {
    pub fn new(module_id: &str) -> Self {
        Self {
            module_id: module_id.to_string(),
            assigned_port: None,
            state: ModuleState::Registered,
            last_health: None,
            last_probe_at: None,
            consecutive_failures: 0,
        }
    }
}

/// `id` is monotonically assigned by the bus within a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source_module_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Known event type taxonomy (spec §9: "a central documented list ... doubles
/// as the taxonomy"). Not exhaustive — modules may publish other dot-separated
/// types — but these are the ones the fabric itself emits or forwards.
pub mod event_types {
    pub const MODULE_STATE_CHANGED: &str = "module.state_changed";
    pub const MODULE_PORT_CONFLICT: &str = "module.port_conflict";
    pub const MODULE_FIXED: &str = "module.fixed";
    pub const TROUBLE_ALERT: &str = "trouble.alert";
    pub const SYNC_SUCCESS: &str = "sync.success";
    pub const SYNC_FAILURE: &str = "sync.failure";
    pub const BUS_FORWARDER_DROPPED: &str = "bus.forwarder_dropped";
}

/// The assembled, bounded per-query snapshot. See spec §3, §4.8.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextBundle {
    pub user: String,
    pub query: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub facts: Vec<Fact>,
    pub semantic_hits: Vec<SemanticHit>,
    pub module_status: HashMap<String, ModuleRuntimeRecord>,
    pub recent_events: Vec<Event>,
    pub remote_excerpt: Option<serde_json::Value>,
    pub metadata: ContextMetadata,
}

impl ContextBundle {
    pub fn empty(user: &str, query: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            user: user.to_string(),
            query,
            timestamp: now,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextMetadata {
    #[serde(default)]
    pub degraded_sections: Vec<String>,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub cache_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticHit {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub key: Option<String>,
    pub metadata: serde_json::Value,
}

/// Direction of a cloud sync transfer. See spec §3, §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub direction: SyncDirection,
    pub payload_ciphertext: Vec<u8>,
    pub auth_token: String,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_reads_nested_ports_api() {
        let raw = r#"{
            "module_id": "rag",
            "name": "RAG",
            "version": "1.0.0",
            "ports": {"api": 5010},
            "entry_point": "./rag",
            "auto_start": true,
            "depends_on": []
        }"#;
        let manifest: ModuleManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.effective_requested_port(), Some(5010));
    }

    #[test]
    fn manifest_falls_back_to_flat_requested_port() {
        let raw = r#"{
            "module_id": "rag",
            "name": "RAG",
            "version": "1.0.0",
            "requested_port": 5011,
            "entry_point": "./rag",
            "auto_start": true,
            "depends_on": []
        }"#;
        let manifest: ModuleManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.effective_requested_port(), Some(5011));
    }

    #[test]
    fn manifest_prefers_nested_ports_over_flat() {
        let raw = r#"{
            "module_id": "rag",
            "name": "RAG",
            "version": "1.0.0",
            "requested_port": 5011,
            "ports": {"api": 5010},
            "entry_point": "./rag",
            "auto_start": true,
            "depends_on": []
        }"#;
        let manifest: ModuleManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.effective_requested_port(), Some(5010));
    }
}
