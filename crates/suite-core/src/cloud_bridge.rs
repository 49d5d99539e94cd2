//! Encrypted bi-directional context sync with a remote peer, plus remote task
//! offload. See spec §4.9. The AEAD construction mirrors `config.rs`'s secret
//! wrapper: AES-256-GCM under a locally held key, never transmitted.

use crate::context::RemoteContextSource;
use crate::error::CloudBridgeError;
use crate::model::{ContextBundle, SyncDirection, SyncEnvelope};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const COMPRESS_THRESHOLD_BYTES: usize = 2 * 1024 * 1024;
const INITIAL_BACKOFF_S: u64 = 10;
const BACKOFF_FACTOR: u64 = 2;
const MAX_BACKOFF_S: u64 = 120;
const MAX_HTTP_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct CloudBridgeConfig {
    pub enabled: bool,
    pub peer_url: String,
    pub auth_token: String,
    pub sync_interval_s: u64,
    pub verify_tls: bool,
    pub encrypt: bool,
}

impl Default for CloudBridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peer_url: String::new(),
            auth_token: String::new(),
            sync_interval_s: 900,
            verify_tls: true,
            encrypt: true,
        }
    }
}

pub struct SyncSummary {
    pub ts: chrono::DateTime<Utc>,
    pub latency_ms: u64,
    pub ok: bool,
}

/// Client half of the sync protocol. Owns the adaptive backoff state and the
/// cancellable auto-sync worker.
pub struct CloudBridge {
    config: CloudBridgeConfig,
    cipher: Option<Aes256Gcm>,
    client: reqwest::Client,
    current_interval_s: AtomicU64,
    backoff_s: AtomicU64,
    healthy: AtomicBool,
    last_sync: RwLock<Option<SyncSummary>>,
    running: Arc<AtomicBool>,
    worker: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl CloudBridge {
    pub fn new(config: CloudBridgeConfig, symmetric_key: Option<[u8; 32]>) -> Self {
        let cipher = symmetric_key.map(|k| Aes256Gcm::new_from_slice(&k).expect("key length is 32"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .expect("client builds");
        let interval = config.sync_interval_s;
        Self {
            config,
            cipher,
            client,
            current_interval_s: AtomicU64::new(interval),
            backoff_s: AtomicU64::new(INITIAL_BACKOFF_S),
            healthy: AtomicBool::new(false),
            last_sync: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            worker: RwLock::new(None),
        }
    }

    fn require_enabled(&self) -> Result<(), CloudBridgeError> {
        if !self.config.enabled {
            return Err(CloudBridgeError::NotConfigured);
        }
        Ok(())
    }

    pub async fn push_context(&self, bundle: &ContextBundle) -> Result<(), CloudBridgeError> {
        self.require_enabled()?;
        let envelope = self.build_envelope(SyncDirection::Push, bundle)?;
        let url = format!("{}/context/push", self.config.peer_url);
        self.send_with_retry(|| {
            self.client
                .post(&url)
                .bearer_auth(&self.config.auth_token)
                .json(&serde_json::json!({ "user": bundle.user, "bundle_ciphertext": envelope.payload_ciphertext, "ts": envelope.ts }))
                .send()
        })
        .await?;
        Ok(())
    }

    pub async fn pull_context(&self, user: &str) -> Result<Option<ContextBundle>, CloudBridgeError> {
        self.require_enabled()?;
        let url = format!("{}/context/pull?user={}", self.config.peer_url, urlencode(user));
        let resp = self
            .send_with_retry(|| self.client.get(&url).bearer_auth(&self.config.auth_token).send())
            .await?;
        if resp.status().as_u16() == 204 {
            return Ok(None);
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| CloudBridgeError::PeerUnreachable(e.to_string()))?;
        let ciphertext = body
            .get("bundle_ciphertext")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|b| b.as_u64()).map(|b| b as u8).collect::<Vec<u8>>());
        match ciphertext {
            Some(ct) if self.config.encrypt => {
                let plain = self.decrypt(&ct)?;
                let bundle: ContextBundle = serde_json::from_slice(&plain).map_err(|_| CloudBridgeError::DecryptFailed)?;
                Ok(Some(bundle))
            }
            _ => {
                let bundle: ContextBundle = serde_json::from_value(body.get("bundle").cloned().unwrap_or(serde_json::Value::Null))
                    .map_err(|e| CloudBridgeError::PeerUnreachable(e.to_string()))?;
                Ok(Some(bundle))
            }
        }
    }

    pub async fn remote_execute(&self, task: &str, params: serde_json::Value) -> Result<serde_json::Value, CloudBridgeError> {
        self.require_enabled()?;
        let url = format!("{}/execute", self.config.peer_url);
        let resp = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .bearer_auth(&self.config.auth_token)
                    .json(&serde_json::json!({ "task": task, "params": params }))
                    .send()
            })
            .await?;
        let body: serde_json::Value = resp.json().await.map_err(|e| CloudBridgeError::PeerUnreachable(e.to_string()))?;
        if let Some(error) = body.get("error") {
            return Err(CloudBridgeError::RemoteTaskError {
                code: error.get("code").and_then(|c| c.as_str()).unwrap_or("unknown").to_string(),
                message: error.get("message").and_then(|m| m.as_str()).unwrap_or("").to_string(),
            });
        }
        Ok(body)
    }

    pub async fn health(&self) -> Result<u64, CloudBridgeError> {
        self.require_enabled()?;
        let url = format!("{}/health", self.config.peer_url);
        let start = std::time::Instant::now();
        self.client
            .get(&url)
            .bearer_auth(&self.config.auth_token)
            .send()
            .await
            .map_err(|e| CloudBridgeError::PeerUnreachable(e.to_string()))?;
        Ok(start.elapsed().as_millis() as u64)
    }

    fn build_envelope(&self, direction: SyncDirection, bundle: &ContextBundle) -> Result<SyncEnvelope, CloudBridgeError> {
        let serialized = serde_json::to_vec(bundle).map_err(|_| CloudBridgeError::DecryptFailed)?;
        let payload = if serialized.len() > COMPRESS_THRESHOLD_BYTES { compress(&serialized) } else { serialized };
        let ciphertext = if self.config.encrypt { self.encrypt(&payload)? } else { payload };
        Ok(SyncEnvelope { direction, payload_ciphertext: ciphertext, auth_token: self.config.auth_token.clone(), ts: Utc::now() })
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CloudBridgeError> {
        let cipher = self.cipher.as_ref().ok_or(CloudBridgeError::DecryptFailed)?;
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ct = cipher.encrypt(&nonce, plain).map_err(|_| CloudBridgeError::DecryptFailed)?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CloudBridgeError> {
        let cipher = self.cipher.as_ref().ok_or(CloudBridgeError::DecryptFailed)?;
        if blob.len() < 12 {
            return Err(CloudBridgeError::DecryptFailed);
        }
        let (nonce_bytes, ct) = blob.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher.decrypt(nonce, ct).map_err(|_| CloudBridgeError::DecryptFailed)
    }

    /// Sends with up to `MAX_HTTP_RETRIES` retries spaced 2s apart on 5xx;
    /// 4xx is terminal for the call (spec §4.9).
    async fn send_with_retry<F, Fut>(&self, make_request: F) -> Result<reqwest::Response, CloudBridgeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 0;
        loop {
            match make_request().await {
                Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 204 => return Ok(resp),
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(CloudBridgeError::PeerUnreachable(format!("http {}", resp.status())));
                }
                Ok(resp) if attempt < MAX_HTTP_RETRIES => {
                    tracing::warn!(status = %resp.status(), attempt, "transient cloud bridge error; retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Ok(resp) => return Err(CloudBridgeError::PeerUnreachable(format!("http {}", resp.status()))),
                Err(e) => return Err(CloudBridgeError::PeerUnreachable(e.to_string())),
            }
        }
    }

    /// Starts the cancellable auto-sync worker: one push (empty-user
    /// broadcast is the caller's responsibility via `push_fn`) per interval,
    /// with adaptive exponential backoff on failure and reset on success.
    pub fn start_auto_sync<F, Fut>(self: &Arc<Self>, sync_fn: F)
    where
        F: Fn(Arc<CloudBridge>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), CloudBridgeError>> + Send,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let wait = this.current_interval_s.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match sync_fn(Arc::clone(&this)).await {
                    Ok(()) => {
                        this.healthy.store(true, Ordering::SeqCst);
                        this.backoff_s.store(INITIAL_BACKOFF_S, Ordering::SeqCst);
                        this.current_interval_s.store(this.config.sync_interval_s, Ordering::SeqCst);
                        *this.last_sync.write().unwrap() = Some(SyncSummary { ts: Utc::now(), latency_ms: 0, ok: true });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "auto-sync cycle failed");
                        this.healthy.store(false, Ordering::SeqCst);
                        let (wait, next_backoff) = advance_backoff(this.backoff_s.load(Ordering::SeqCst));
                        this.current_interval_s.store(wait, Ordering::SeqCst);
                        this.backoff_s.store(next_backoff, Ordering::SeqCst);
                        *this.last_sync.write().unwrap() = Some(SyncSummary { ts: Utc::now(), latency_ms: 0, ok: false });
                    }
                }
            }
        });
        *self.worker.write().unwrap() = Some(handle);
    }

    /// Cancels the auto-sync worker, waiting up to 5s for the in-flight cycle.
    pub async fn stop_auto_sync(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.worker.write().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    pub fn last_sync_summary(&self) -> Option<(chrono::DateTime<Utc>, bool)> {
        self.last_sync.read().unwrap().as_ref().map(|s| (s.ts, s.ok))
    }
}

#[async_trait]
impl RemoteContextSource for CloudBridge {
    async fn pull_remote(&self, user: &str) -> Option<ContextBundle> {
        self.pull_context(user).await.ok().flatten()
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Given the current backoff rung, returns `(wait_before_next_attempt,
/// next_rung_if_that_attempt_also_fails)` — spec §4.9/scenario S4's
/// 10s,20s,40s,80s,120s,120s,... ladder.
fn advance_backoff(current_backoff: u64) -> (u64, u64) {
    let next = (current_backoff * BACKOFF_FACTOR).min(MAX_BACKOFF_S);
    (current_backoff, next)
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_string() } else { format!("%{:02X}", c as u32) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let config = CloudBridgeConfig { enabled: true, peer_url: "http://x".to_string(), auth_token: "t".to_string(), ..Default::default() };
        let bridge = CloudBridge::new(config, Some(key()));
        let ct = bridge.encrypt(b"hello world").unwrap();
        let pt = bridge.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn decrypt_with_wrong_key_fails_without_leaking_plaintext() {
        let config = CloudBridgeConfig { enabled: true, peer_url: "http://x".to_string(), auth_token: "t".to_string(), ..Default::default() };
        let bridge_a = CloudBridge::new(config.clone(), Some([1u8; 32]));
        let bridge_b = CloudBridge::new(config, Some([2u8; 32]));
        let ct = bridge_a.encrypt(b"secret").unwrap();
        assert!(bridge_b.decrypt(&ct).is_err());
    }

    #[tokio::test]
    async fn disabled_bridge_returns_not_configured() {
        let bridge = CloudBridge::new(CloudBridgeConfig::default(), None);
        let err = bridge.health().await.unwrap_err();
        assert!(matches!(err, CloudBridgeError::NotConfigured));
    }

    #[test]
    fn backoff_ladder_matches_retry_cadence() {
        let mut backoff = INITIAL_BACKOFF_S;
        let mut waits = Vec::new();
        for _ in 0..6 {
            let (wait, next) = advance_backoff(backoff);
            waits.push(wait);
            backoff = next;
        }
        assert_eq!(waits, vec![10, 20, 40, 80, 120, 120]);
    }
}
