//! Module discovery, port allocation, and child-process lifecycle. See spec §4.6.
//!
//! The runtime table is guarded by a registry-wide lock (`DashMap` per
//! `module_id`, the same concurrent-map discipline `FactStore` uses); reads
//! for snapshots are copy-outs, never references into the table. Process
//! handles live only here — `ModuleRuntimeRecord` (in `model.rs`) is the
//! serializable, handle-free view that crosses the HTTP surface.

use crate::error::RegistryError;
use crate::event_bus::EventBus;
use crate::model::{event_types, ModuleManifest, ModuleRuntimeRecord, ModuleState};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

struct RuntimeEntry {
    manifest: ModuleManifest,
    record: ModuleRuntimeRecord,
    child: Option<Child>,
}

/// Discovers `module_info.json` manifests, allocates ports, and supervises
/// each module's child process. One instance per suite process.
pub struct ModuleRegistry {
    modules_dir: PathBuf,
    port_range: (u16, u16),
    auth_token: String,
    bus: Arc<EventBus>,
    entries: DashMap<String, RuntimeEntry>,
}

impl ModuleRegistry {
    pub fn new(modules_dir: impl Into<PathBuf>, port_range: (u16, u16), auth_token: String, bus: Arc<EventBus>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            port_range,
            auth_token,
            bus,
            entries: DashMap::new(),
        }
    }

    /// Scans `modules_dir` for subdirectories containing `module_info.json`.
    /// A duplicate `module_id` rejects every occurrence after the first and
    /// logs an error rather than aborting discovery (spec §4.6).
    pub fn register_all(&self) -> Result<usize, RegistryError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut registered = 0usize;
        let read_dir = match std::fs::read_dir(&self.modules_dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(RegistryError::Io(e)),
        };
        for entry in read_dir {
            let entry = entry.map_err(RegistryError::Io)?;
            let manifest_path = entry.path().join("module_info.json");
            if !manifest_path.exists() {
                continue;
            }
            let manifest = match load_manifest(&manifest_path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(path = %manifest_path.display(), error = %e, "rejecting invalid module manifest");
                    continue;
                }
            };
            if !seen.insert(manifest.module_id.clone()) {
                tracing::error!(module_id = %manifest.module_id, "duplicate module_id; rejecting this and the prior registration");
                self.entries.remove(&manifest.module_id);
                continue;
            }
            let module_id = manifest.module_id.clone();
            self.entries.insert(
                module_id.clone(),
                RuntimeEntry { manifest, record: ModuleRuntimeRecord::new(&module_id), child: None },
            );
            registered += 1;
        }
        Ok(registered)
    }

    /// Topologically orders `auto_start` modules by `depends_on` and starts
    /// each in turn. A dependency cycle aborts before any process is spawned.
    pub async fn start_all(&self) -> Result<(), RegistryError> {
        let order = self.topological_order()?;
        for module_id in order {
            let auto_start = self.entries.get(&module_id).map(|e| e.manifest.auto_start).unwrap_or(false);
            if !auto_start {
                continue;
            }
            let deps: Vec<String> = self
                .entries
                .get(&module_id)
                .map(|e| e.manifest.depends_on.iter().cloned().collect())
                .unwrap_or_default();
            let mut unmet = None;
            for dep in &deps {
                let healthy = self.entries.get(dep).map(|e| e.record.state == ModuleState::Healthy).unwrap_or(false);
                if !healthy {
                    unmet = Some(dep.clone());
                    break;
                }
            }
            if let Some(dep) = unmet {
                tracing::error!(module_id = %module_id, dependency = %dep, "dependency unmet; not starting");
                self.transition(&module_id, ModuleState::Unhealthy);
                continue;
            }
            if let Err(e) = self.start_one(&module_id).await {
                tracing::error!(module_id = %module_id, error = %e, "module failed to start; continuing with the rest");
            }
        }
        Ok(())
    }

    fn topological_order(&self) -> Result<Vec<String>, RegistryError> {
        let graph: HashMap<String, HashSet<String>> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().manifest.depends_on.clone()))
            .collect();
        let mut order = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut in_progress: HashSet<String> = HashSet::new();

        fn visit(
            node: &str,
            graph: &HashMap<String, HashSet<String>>,
            visited: &mut HashSet<String>,
            in_progress: &mut HashSet<String>,
            order: &mut Vec<String>,
            path: &mut Vec<String>,
        ) -> Result<(), RegistryError> {
            if visited.contains(node) {
                return Ok(());
            }
            if !in_progress.insert(node.to_string()) {
                path.push(node.to_string());
                return Err(RegistryError::DependencyCycle(path.clone()));
            }
            path.push(node.to_string());
            if let Some(deps) = graph.get(node) {
                for dep in deps {
                    visit(dep, graph, visited, in_progress, order, path)?;
                }
            }
            path.pop();
            in_progress.remove(node);
            visited.insert(node.to_string());
            order.push(node.to_string());
            Ok(())
        }

        for node in graph.keys() {
            let mut path = Vec::new();
            visit(node, &graph, &mut visited, &mut in_progress, &mut order, &mut path)?;
        }
        Ok(order)
    }

    /// Allocates a port, spawns the module's entry point, and polls `/health`
    /// until it reports healthy or the startup budget expires.
    pub async fn start_one(&self, module_id: &str) -> Result<(), RegistryError> {
        self.transition(module_id, ModuleState::Starting);
        let manifest = self
            .entries
            .get(module_id)
            .map(|e| e.manifest.clone())
            .ok_or_else(|| RegistryError::ManifestInvalid(module_id.to_string()))?;

        let port = self.allocate_port(manifest.effective_requested_port())?;
        let child = Command::new(&manifest.entry_point)
            .env("PORT", port.to_string())
            .env("AUTH_TOKEN", &self.auth_token)
            .kill_on_drop(true)
            .spawn()
            .map_err(RegistryError::Io)?;

        if let Some(mut entry) = self.entries.get_mut(module_id) {
            entry.record.assigned_port = Some(port);
            entry.child = Some(child);
        }

        self.poll_until_healthy(module_id, port, &manifest.health_route, Duration::from_secs(30)).await
    }

    async fn poll_until_healthy(&self, module_id: &str, port: u16, health_route: &str, budget: Duration) -> Result<(), RegistryError> {
        let deadline = Instant::now() + budget;
        let mut backoff = INITIAL_BACKOFF;
        let client = reqwest::Client::builder().timeout(Duration::from_secs(3)).build().expect("client builds");
        let url = format!("http://127.0.0.1:{port}{health_route}");

        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(body) = resp.json::<serde_json::Value>().await {
                        if body.get("module_id").and_then(|v| v.as_str()) == Some(module_id) {
                            self.transition(module_id, ModuleState::Healthy);
                            return Ok(());
                        }
                    }
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                self.transition(module_id, ModuleState::Unhealthy);
                return Err(RegistryError::StartTimeout(module_id.to_string()));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Tries `requested` first (if set and in range), then scans the
    /// configured range upward, wrapping once. Returns `PortExhausted` if
    /// every port in the range is in use (spec §4.6 step 2-4).
    fn allocate_port(&self, requested: Option<u16>) -> Result<u16, RegistryError> {
        let (start, end) = self.port_range;
        let assigned: HashSet<u16> = self.entries.iter().filter_map(|e| e.record.assigned_port).collect();

        if let Some(p) = requested {
            if p >= start && p <= end && !assigned.contains(&p) && port_is_free(p) {
                return Ok(p);
            }
        }
        let search_start = requested.filter(|p| *p >= start && *p <= end).unwrap_or(start);
        let span = end - start + 1;
        for offset in 0..span {
            let candidate = start + ((search_start - start + offset) % span);
            if !assigned.contains(&candidate) && port_is_free(candidate) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::PortExhausted)
    }

    /// Graceful stop: SIGTERM-equivalent, wait up to `grace_period`, then kill.
    pub async fn stop_one(&self, module_id: &str, grace_period: Duration) -> Result<(), RegistryError> {
        self.transition(module_id, ModuleState::Stopping);
        let mut child = match self.entries.get_mut(module_id).and_then(|mut e| e.child.take()) {
            Some(c) => c,
            None => {
                self.transition(module_id, ModuleState::Stopped);
                return Ok(());
            }
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let waited = tokio::time::timeout(grace_period, child.wait()).await;
        if waited.is_err() {
            let _ = child.kill().await;
        }
        if let Some(mut entry) = self.entries.get_mut(module_id) {
            entry.record.assigned_port = None;
        }
        self.transition(module_id, ModuleState::Stopped);
        Ok(())
    }

    pub async fn stop_all(&self, grace_period: Duration) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop_one(&id, grace_period).await {
                tracing::error!(module_id = %id, error = %e, "error stopping module");
            }
        }
    }

    /// Applies a health-probe result to the state machine: `healthy|degraded`
    /// transitions on success, `unhealthy` after `failure_threshold`
    /// consecutive failures (spec §4.6, §4.7).
    pub fn apply_probe_result(&self, module_id: &str, outcome: ProbeOutcome, failure_threshold: u32) {
        let Some(mut entry) = self.entries.get_mut(module_id) else { return };
        match outcome {
            ProbeOutcome::Healthy => {
                entry.record.consecutive_failures = 0;
                entry.record.state = ModuleState::Healthy;
            }
            ProbeOutcome::Degraded => {
                entry.record.consecutive_failures = 0;
                entry.record.state = ModuleState::Degraded;
            }
            ProbeOutcome::Failed => {
                entry.record.consecutive_failures += 1;
                if entry.record.consecutive_failures >= failure_threshold {
                    entry.record.state = ModuleState::Unhealthy;
                }
            }
        }
        entry.record.last_probe_at = Some(chrono::Utc::now());
        drop(entry);
        self.publish_state_changed(module_id);
    }

    fn transition(&self, module_id: &str, state: ModuleState) {
        if let Some(mut entry) = self.entries.get_mut(module_id) {
            entry.record.state = state;
        } else {
            self.entries.insert(
                module_id.to_string(),
                RuntimeEntry {
                    manifest: ModuleManifest {
                        module_id: module_id.to_string(),
                        name: module_id.to_string(),
                        version: "0.0.0".to_string(),
                        requested_port: None,
                        ports: None,
                        entry_point: String::new(),
                        auto_start: false,
                        depends_on: HashSet::new(),
                        declared_endpoints: Vec::new(),
                        description: None,
                        health_route: "/health".to_string(),
                    },
                    record: {
                        let mut r = ModuleRuntimeRecord::new(module_id);
                        r.state = state;
                        r
                    },
                    child: None,
                },
            );
        }
        self.publish_state_changed(module_id);
        if state == ModuleState::Unhealthy {
            self.bus.publish(
                event_types::MODULE_PORT_CONFLICT,
                Some(module_id),
                serde_json::json!({ "module_id": module_id }),
            );
        }
    }

    fn publish_state_changed(&self, module_id: &str) {
        let state = self.entries.get(module_id).map(|e| e.record.state);
        if let Some(state) = state {
            self.bus.publish(
                event_types::MODULE_STATE_CHANGED,
                Some(module_id),
                serde_json::json!({ "module_id": module_id, "state": state.to_string() }),
            );
        }
    }

    /// Snapshot-safe, handle-free view of the runtime table (spec §3).
    pub fn snapshot(&self) -> Vec<ModuleRuntimeRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    pub fn get(&self, module_id: &str) -> Option<ModuleRuntimeRecord> {
        self.entries.get(module_id).map(|e| e.record.clone())
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// The module's declared `health_route` (spec §6), for probes issued
    /// outside the registry itself (the periodic sweep in `health.rs`).
    pub fn health_route(&self, module_id: &str) -> Option<String> {
        self.entries.get(module_id).map(|e| e.manifest.health_route.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Degraded,
    Failed,
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn load_manifest(path: &Path) -> Result<ModuleManifest, RegistryError> {
    let raw = std::fs::read_to_string(path).map_err(RegistryError::Io)?;
    let manifest: ModuleManifest =
        serde_json::from_str(&raw).map_err(|e| RegistryError::ManifestInvalid(e.to_string()))?;
    if manifest.module_id.trim().is_empty() {
        return Err(RegistryError::ManifestInvalid("module_id is empty".to_string()));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as HSet;

    fn manifest(id: &str, depends_on: &[&str]) -> ModuleManifest {
        ModuleManifest {
            module_id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            requested_port: None,
            ports: None,
            entry_point: "/bin/true".to_string(),
            auto_start: true,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect::<HSet<_>>(),
            declared_endpoints: Vec::new(),
            description: None,
            health_route: "/health".to_string(),
        }
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new("/nonexistent", (5000, 5099), "token".to_string(), EventBus::new())
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let reg = registry();
        reg.entries.insert("b".to_string(), RuntimeEntry { manifest: manifest("b", &["a"]), record: ModuleRuntimeRecord::new("b"), child: None });
        reg.entries.insert("a".to_string(), RuntimeEntry { manifest: manifest("a", &[]), record: ModuleRuntimeRecord::new("a"), child: None });
        let order = reg.topological_order().unwrap();
        assert!(order.iter().position(|x| x == "a").unwrap() < order.iter().position(|x| x == "b").unwrap());
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let reg = registry();
        reg.entries.insert("a".to_string(), RuntimeEntry { manifest: manifest("a", &["b"]), record: ModuleRuntimeRecord::new("a"), child: None });
        reg.entries.insert("b".to_string(), RuntimeEntry { manifest: manifest("b", &["a"]), record: ModuleRuntimeRecord::new("b"), child: None });
        assert!(matches!(reg.topological_order(), Err(RegistryError::DependencyCycle(_))));
    }

    #[test]
    fn port_conflict_resolves_to_next_free_port() {
        let reg = registry();
        reg.entries.insert(
            "a".to_string(),
            RuntimeEntry { manifest: manifest("a", &[]), record: { let mut r = ModuleRuntimeRecord::new("a"); r.assigned_port = Some(5000); r }, child: None },
        );
        let port = reg.allocate_port(Some(5000)).unwrap();
        assert_ne!(port, 5000);
        assert!(port >= 5000 && port <= 5099);
    }

    #[test]
    fn apply_probe_result_transitions_to_unhealthy_after_threshold() {
        let reg = registry();
        reg.entries.insert("a".to_string(), RuntimeEntry { manifest: manifest("a", &[]), record: ModuleRuntimeRecord::new("a"), child: None });
        reg.apply_probe_result("a", ProbeOutcome::Failed, 3);
        reg.apply_probe_result("a", ProbeOutcome::Failed, 3);
        assert_eq!(reg.get("a").unwrap().consecutive_failures, 2);
        assert_ne!(reg.get("a").unwrap().state, ModuleState::Unhealthy);
        reg.apply_probe_result("a", ProbeOutcome::Failed, 3);
        assert_eq!(reg.get("a").unwrap().state, ModuleState::Unhealthy);
    }
}
