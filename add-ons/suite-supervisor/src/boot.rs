//! Boots the fabric singletons in the order spec'd for the process, and
//! tears them down in reverse on shutdown. See spec §4.11.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use suite_core::cloud_bridge::{CloudBridge, CloudBridgeConfig};
use suite_core::context::{ContextGraph, ContextOptions, RemoteContextSource};
use suite_core::error::CloudBridgeError;
use suite_core::event_bus::EventBus;
use suite_core::fact_store::{self, FactStore};
use suite_core::health::HealthMonitor;
use suite_core::registry::ModuleRegistry;
use suite_core::vector_index::{FlatVectorIndex, VectorIndex};
use suite_core::{auth, logger, ConfigStore};

/// Everything the HTTP surface and CLI need a handle to, for the lifetime of
/// one `suite start` process.
pub struct Suite {
    pub config: Arc<ConfigStore>,
    /// Taken and explicitly closed by `shutdown()`, last; `None` afterwards.
    pub logger: std::sync::Mutex<Option<logger::LoggerHandle>>,
    pub facts: Arc<FactStore>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ModuleRegistry>,
    pub health: Arc<HealthMonitor>,
    pub cloud_bridge: Option<Arc<CloudBridge>>,
    pub context: Arc<ContextGraph>,
    pub auth_token: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub grace_period: Duration,
    pub vector_store_path: PathBuf,
}

#[derive(Debug)]
pub enum BootError {
    Config(suite_core::ConfigError),
    FactStoreCorrupted(suite_core::FactStoreError),
    Io(std::io::Error),
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::Config(e) => write!(f, "config error: {e}"),
            BootError::FactStoreCorrupted(e) => write!(f, "fact store corrupted: {e}"),
            BootError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

/// Boot order: Config → Logger → FactStore → VectorIndex → EventBus →
/// Registry.discover → Registry.start(auto_start) → HealthMonitor.start →
/// CloudBridge.start_auto_sync (if enabled). The caller opens the HTTP
/// surface once this returns.
pub async fn boot(base_dir: &std::path::Path) -> Result<Suite, BootError> {
    let mut secret_paths = HashSet::new();
    secret_paths.insert("auth_token".to_string());
    secret_paths.insert("cloud.auth_token".to_string());
    secret_paths.insert("cloud.symmetric_key".to_string());

    let config = Arc::new(
        ConfigStore::open(base_dir.join("config/suite_config.json"), base_dir.join("config/modules"), secret_paths)
            .map_err(BootError::Config)?,
    );
    let effective = config.effective();

    let logs_dir = base_dir.join("logs");
    let logger_handle = logger::init(&logs_dir).map_err(BootError::Io)?;
    tracing::info!("suite booting");

    let auth_token = match config.get("auth_token").and_then(|v| v.as_str().map(|s| s.to_string())) {
        Some(t) => t,
        None => {
            let t = auth::generate_token();
            let _ = config.set("auth_token", serde_json::Value::String(t.clone()), true);
            t
        }
    };

    let facts = fact_store::open_or_fatal(base_dir.join("data/facts")).map_err(BootError::FactStoreCorrupted)?;

    let vector_store_path = base_dir.join("data/vectors");
    let vector_index: Arc<dyn VectorIndex> = Arc::new(FlatVectorIndex::new(&vector_store_path, None));

    let bus = EventBus::new();
    if let Some(webhook_url) = config.get("webhook_url").and_then(|v| v.as_str().map(|s| s.to_string())) {
        bus.start_forwarder(
            webhook_url,
            vec![
                suite_core::event_types::TROUBLE_ALERT.to_string(),
                suite_core::event_types::MODULE_FIXED.to_string(),
                suite_core::event_types::SYNC_SUCCESS.to_string(),
            ],
            None,
        );
    }

    let port_range = (effective.port_range_start, effective.port_range_end);
    let registry = Arc::new(ModuleRegistry::new(
        PathBuf::from(&effective.modules_dir),
        port_range,
        auth_token.clone(),
        Arc::clone(&bus),
    ));
    if let Err(e) = registry.register_all() {
        tracing::error!(error = %e, "module discovery failed");
    }
    if let Err(e) = registry.start_all().await {
        tracing::error!(error = %e, "module startup sequence reported an error");
    }

    let health = HealthMonitor::new(
        Arc::clone(&registry),
        Duration::from_secs(effective.health_interval_s),
        Duration::from_secs(3),
        effective.health_probe_concurrency,
        effective.failure_threshold,
        effective.ollama_like_url.clone(),
    );
    health.start();

    let cloud_bridge = build_cloud_bridge(&config);
    let remote: Option<Arc<dyn RemoteContextSource>> = cloud_bridge.clone().map(|b| b as Arc<dyn RemoteContextSource>);
    let context = Arc::new(ContextGraph::new(Arc::clone(&facts), Some(Arc::clone(&vector_index)), None, Arc::clone(&registry), Arc::clone(&health), remote));

    if let Some(bridge) = &cloud_bridge {
        let bus_for_sync = Arc::clone(&bus);
        let context_for_sync = Arc::clone(&context);
        let facts_for_sync = Arc::clone(&facts);
        bridge.start_auto_sync(move |b| {
            let bus_for_sync = Arc::clone(&bus_for_sync);
            let context_for_sync = Arc::clone(&context_for_sync);
            let facts_for_sync = Arc::clone(&facts_for_sync);
            async move { sync_cycle(&b, &context_for_sync, &facts_for_sync, &bus_for_sync).await.map(|_| ()) }
        });
    }

    Ok(Suite {
        config,
        logger: std::sync::Mutex::new(Some(logger_handle)),
        facts,
        vector_index,
        bus,
        registry,
        health,
        cloud_bridge,
        context,
        auth_token,
        started_at: chrono::Utc::now(),
        grace_period: Duration::from_secs(effective.grace_period_s),
        vector_store_path,
    })
}

/// One push+pull cycle over every user with at least one locally known fact
/// (spec §4.9: sync is per-user, the same scope `remember`/`recall` use).
/// A push or pull failure for any user aborts the cycle and is surfaced as
/// `Err` (driving `start_auto_sync`'s backoff); facts merged for users
/// processed earlier in the same cycle are kept. Used both by the
/// background auto-sync worker and by the `/sync/now` HTTP handler so the
/// two never drift out of sync with each other.
pub async fn sync_cycle(
    bridge: &CloudBridge,
    context: &ContextGraph,
    facts: &FactStore,
    bus: &EventBus,
) -> Result<usize, CloudBridgeError> {
    match run_sync_cycle(bridge, context, facts).await {
        Ok(n) => {
            bus.publish(suite_core::event_types::SYNC_SUCCESS, Some("cloud_bridge"), serde_json::json!({ "users_synced": n }));
            Ok(n)
        }
        Err(e) => {
            bus.publish(suite_core::event_types::SYNC_FAILURE, Some("cloud_bridge"), serde_json::json!({ "error": e.to_string() }));
            Err(e)
        }
    }
}

async fn run_sync_cycle(bridge: &CloudBridge, context: &ContextGraph, facts: &FactStore) -> Result<usize, CloudBridgeError> {
    let users = facts.known_users().unwrap_or_default();
    let options = ContextOptions::defaults();
    for user in &users {
        let bundle = context.build(user, None, &options, Vec::new()).await;
        bridge.push_context(&bundle).await?;
        if let Some(remote_bundle) = bridge.pull_context(user).await? {
            for fact in remote_bundle.facts {
                let _ = facts.remember(&fact.user, &fact.key, &fact.value, fact.confidence, &fact.category);
            }
        }
    }
    Ok(users.len())
}

fn build_cloud_bridge(config: &ConfigStore) -> Option<Arc<CloudBridge>> {
    let enabled = config.get_or("cloud.enabled", false);
    if !enabled {
        return None;
    }
    let cfg = CloudBridgeConfig {
        enabled,
        peer_url: config.get_or("cloud.peer_url", String::new()),
        auth_token: config.get_or("cloud.auth_token", String::new()),
        sync_interval_s: config.get_or("cloud.sync_interval_s", 900u64),
        verify_tls: config.get_or("cloud.verify_tls", true),
        encrypt: config.get_or("cloud.encrypt", true),
    };
    let key_hex: Option<String> = config.get("cloud.symmetric_key").and_then(|v| v.as_str().map(|s| s.to_string()));
    let key = key_hex.and_then(|hex| {
        let bytes = hex_decode(&hex)?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(arr)
    });
    Some(Arc::new(CloudBridge::new(cfg, key)))
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok()).collect()
}

/// Shutdown order per spec §4.11: CloudBridge.stop_auto_sync →
/// HealthMonitor.stop → Registry.stop_all → VectorIndex.close →
/// FactStore.close → Logger.close (last, so every step above still logs).
pub async fn shutdown(suite: &Suite) {
    tracing::info!("suite shutting down");
    if let Some(bridge) = &suite.cloud_bridge {
        bridge.stop_auto_sync().await;
    }
    suite.health.stop().await;
    suite.registry.stop_all(suite.grace_period).await;
    if let Err(e) = suite.vector_index.close() {
        tracing::error!(error = %e, "error closing vector index");
    }
    if let Err(e) = suite.facts.close() {
        tracing::error!(error = %e, "error closing fact store");
    }
    if let Some(handle) = suite.logger.lock().unwrap().take() {
        handle.close();
    }
}
