//! Periodic health sweeps of registered modules and an optional Ollama-like
//! external. See spec §4.7.

use crate::registry::{ModuleRegistry, ProbeOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub module_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ModuleHealthResponse {
    status: String,
    module_id: String,
}

/// Owns the periodic sweep loop. One instance per suite process, `start()`ed
/// once and `stop()`ped on shutdown.
pub struct HealthMonitor {
    registry: Arc<ModuleRegistry>,
    interval: Duration,
    probe_timeout: Duration,
    concurrency: usize,
    failure_threshold: u32,
    ollama_like_url: Option<String>,
    running: Arc<AtomicBool>,
    last_snapshot: Mutex<HashMap<String, HealthStatus>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        interval: Duration,
        probe_timeout: Duration,
        concurrency: usize,
        failure_threshold: u32,
        ollama_like_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            interval,
            probe_timeout,
            concurrency,
            failure_threshold,
            ollama_like_url,
            running: Arc::new(AtomicBool::new(false)),
            last_snapshot: Mutex::new(HashMap::new()),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                this.sweep().await;
                tokio::time::sleep(this.interval).await;
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// One full sweep, bounded to `concurrency` in-flight probes (spec §5).
    pub async fn sweep(&self) {
        let module_ids = self.registry.module_ids();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut tasks = Vec::new();
        for module_id in module_ids {
            let permit = Arc::clone(&semaphore);
            let timeout = self.probe_timeout;
            let registry = Arc::clone(&self.registry);
            let threshold = self.failure_threshold;
            tasks.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let port = registry.get(&module_id).and_then(|r| r.assigned_port);
                let Some(port) = port else { return (module_id, None) };
                let health_route = registry.health_route(&module_id).unwrap_or_else(|| "/health".to_string());
                let outcome = probe_module(&module_id, port, &health_route, timeout).await;
                registry.apply_probe_result(&module_id, outcome.0, threshold);
                (module_id, Some(outcome.1))
            }));
        }
        let mut snapshot = HashMap::new();
        for task in tasks {
            if let Ok((module_id, status)) = task.await {
                if let Some(status) = status {
                    snapshot.insert(module_id.clone(), HealthStatus { module_id, status });
                }
            }
        }
        if let Some(url) = &self.ollama_like_url {
            let ok = probe_ollama_like(url, self.probe_timeout).await;
            snapshot.insert(
                "ollama_like".to_string(),
                HealthStatus { module_id: "ollama_like".to_string(), status: if ok { "healthy".to_string() } else { "unhealthy".to_string() } },
            );
        }
        *self.last_snapshot.lock().unwrap() = snapshot;
    }

    pub fn snapshot(&self) -> HashMap<String, HealthStatus> {
        self.last_snapshot.lock().unwrap().clone()
    }
}

async fn probe_module(module_id: &str, port: u16, health_route: &str, timeout: Duration) -> (ProbeOutcome, String) {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return (ProbeOutcome::Failed, "unhealthy".to_string()),
    };
    let url = format!("http://127.0.0.1:{port}{health_route}");
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<ModuleHealthResponse>().await {
            Ok(body) if body.module_id == module_id && body.status == "healthy" => (ProbeOutcome::Healthy, "healthy".to_string()),
            Ok(body) if body.module_id == module_id && body.status == "degraded" => (ProbeOutcome::Degraded, "degraded".to_string()),
            _ => (ProbeOutcome::Failed, "unhealthy".to_string()),
        },
        _ => (ProbeOutcome::Failed, "unhealthy".to_string()),
    }
}

async fn probe_ollama_like(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    client.get(url).send().await.map(|r| r.status().is_success()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::registry::ModuleRegistry;

    #[tokio::test]
    async fn sweep_with_no_modules_produces_empty_snapshot() {
        let registry = Arc::new(ModuleRegistry::new("/nonexistent", (5000, 5099), "t".to_string(), EventBus::new()));
        let monitor = HealthMonitor::new(registry, Duration::from_secs(30), Duration::from_secs(3), 8, 3, None);
        monitor.sweep().await;
        assert!(monitor.snapshot().is_empty());
    }

    #[tokio::test]
    async fn probe_module_hits_the_declared_health_route_not_the_default() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requested_path = Arc::new(Mutex::new(String::new()));
        let requested_path_srv = Arc::clone(&requested_path);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request.lines().next().unwrap_or("").split_whitespace().nth(1).unwrap_or("").to_string();
            *requested_path_srv.lock().unwrap() = path;
            let body = serde_json::json!({ "module_id": "m1", "status": "healthy" }).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });

        let (outcome, status) = probe_module("m1", port, "/custom/health", Duration::from_secs(3)).await;
        assert_eq!(outcome, ProbeOutcome::Healthy);
        assert_eq!(status, "healthy");
        assert_eq!(*requested_path.lock().unwrap(), "/custom/health");
    }

    #[tokio::test]
    async fn start_then_stop_does_not_panic() {
        let registry = Arc::new(ModuleRegistry::new("/nonexistent", (5000, 5099), "t".to_string(), EventBus::new()));
        let monitor = HealthMonitor::new(registry, Duration::from_millis(10), Duration::from_secs(1), 8, 3, None);
        monitor.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop().await;
    }
}
