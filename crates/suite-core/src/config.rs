//! Layered configuration store. See spec §3 ("Configuration"), §4.1.
//!
//! Layers, lowest to highest precedence: built-in defaults, the suite config
//! file (`config/suite_config.json`), per-module config files
//! (`config/{module_id}_config.json`), then environment variables (never
//! persisted). Secrets are wrapped with AES-256-GCM under a process-local key
//! file, in the style of the teacher's `shadow_store.rs`.

use crate::error::ConfigError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const WRAP_PREFIX: &str = "wrapped:v1:";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Effective, merged suite configuration. Individual fields fall back to
/// defaults the way the teacher's `SovereignConfig::from_env` does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_modules_dir")]
    pub modules_dir: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_startup_budget_s")]
    pub startup_budget_s: u64,
    #[serde(default = "default_grace_period_s")]
    pub grace_period_s: u64,
    #[serde(default = "default_health_interval_s")]
    pub health_interval_s: u64,
    #[serde(default = "default_health_probe_concurrency")]
    pub health_probe_concurrency: usize,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub ollama_like_url: Option<String>,
    #[serde(default = "default_true")]
    pub cloud_enabled_default: bool,
    #[serde(default = "default_vector_store")]
    pub vector_store: String,
    #[serde(default)]
    pub bind_localhost_only: bool,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_bind_host() -> String { "127.0.0.1".to_string() }
fn default_http_port() -> u16 { 5000 }
fn default_port_range_start() -> u16 { 5000 }
fn default_port_range_end() -> u16 { 5999 }
fn default_modules_dir() -> String { "modules".to_string() }
fn default_state_dir() -> String { "state".to_string() }
fn default_startup_budget_s() -> u64 { 30 }
fn default_grace_period_s() -> u64 { 5 }
fn default_health_interval_s() -> u64 { 30 }
fn default_health_probe_concurrency() -> usize { 8 }
fn default_failure_threshold() -> u32 { 3 }
fn default_true() -> bool { true }
fn default_vector_store() -> String { "flat-like".to_string() }

impl Default for SuiteConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("all fields have defaults")
    }
}

/// Config store: get/set/reload over dotted paths, with a secret-wrapping layer.
/// See spec §4.1.
pub struct ConfigStore {
    suite_path: PathBuf,
    module_dir: PathBuf,
    secret_paths: HashSet<String>,
    cipher: RwLock<Option<Aes256Gcm>>,
    snapshot: RwLock<Value>,
}

impl ConfigStore {
    /// Loads the suite config file (or compiled-in defaults if absent) plus
    /// the secrets wrapper key at `data/keys/suite_wrapper.key`.
    pub fn open<P: AsRef<Path>>(suite_path: P, module_dir: P, secret_paths: HashSet<String>) -> Result<Self, ConfigError> {
        let suite_path = suite_path.as_ref().to_path_buf();
        let module_dir = module_dir.as_ref().to_path_buf();
        let cipher = load_or_create_wrapper_key(&suite_path)?;
        let store = Self {
            suite_path,
            module_dir,
            secret_paths,
            cipher: RwLock::new(cipher),
            snapshot: RwLock::new(Value::Object(Default::default())),
        };
        store.reload()?;
        Ok(store)
    }

    /// Rebuilds the in-memory snapshot from defaults + suite file + env.
    /// Config reads are lock-free against this snapshot (spec §5); only
    /// `reload`/`set` take the write lock.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let defaults = serde_json::to_value(SuiteConfig::default())?;
        let mut merged = defaults;
        if self.suite_path.exists() {
            let raw = fs::read_to_string(&self.suite_path)?;
            let file_value: Value = serde_json::from_str(&raw)?;
            merge_json(&mut merged, &file_value);
        }
        self.unwrap_secrets(&mut merged)?;
        apply_env_overrides(&mut merged);
        *self.snapshot.write().unwrap() = merged;
        Ok(())
    }

    /// Dotted-path lookup against the effective merged snapshot.
    pub fn get(&self, path: &str) -> Option<Value> {
        let snap = self.snapshot.read().unwrap();
        get_path(&snap, path).cloned()
    }

    pub fn get_or<T: for<'de> Deserialize<'de>>(&self, path: &str, default: T) -> T {
        self.get(path)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    /// The fully merged `SuiteConfig`, for components that want a typed view.
    pub fn effective(&self) -> SuiteConfig {
        let snap = self.snapshot.read().unwrap();
        serde_json::from_value(snap.clone()).unwrap_or_default()
    }

    /// Sets a value. `persistent` writes only the suite-owned layer, atomically
    /// (write temp + rename), wrapping the value first if `path` is declared secret.
    pub fn set(&self, path: &str, value: Value, persistent: bool) -> Result<(), ConfigError> {
        {
            let mut snap = self.snapshot.write().unwrap();
            set_path(&mut snap, path, value.clone());
        }
        if persistent {
            self.persist(path, value)?;
        }
        Ok(())
    }

    fn persist(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let mut on_disk: Value = if self.suite_path.exists() {
            serde_json::from_str(&fs::read_to_string(&self.suite_path)?)?
        } else {
            Value::Object(Default::default())
        };
        let stored = if self.secret_paths.contains(path) {
            Value::String(self.wrap_secret(&value)?)
        } else {
            value
        };
        set_path(&mut on_disk, path, stored);
        atomic_write(&self.suite_path, &serde_json::to_vec_pretty(&on_disk)?)?;
        Ok(())
    }

    fn wrap_secret(&self, value: &Value) -> Result<String, ConfigError> {
        let guard = self.cipher.read().unwrap();
        let cipher = guard.as_ref().ok_or(ConfigError::SecretsLocked)?;
        let plain = serde_json::to_vec(value)?;
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ct = cipher
            .encrypt(&nonce, plain.as_ref())
            .map_err(|_| ConfigError::SecretsLocked)?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ct);
        Ok(format!("{WRAP_PREFIX}{}", hex_encode(&out)))
    }

    fn unwrap_secret(&self, wrapped: &str) -> Result<Value, ConfigError> {
        let guard = self.cipher.read().unwrap();
        let cipher = guard.as_ref().ok_or(ConfigError::SecretsLocked)?;
        let raw = hex_decode(&wrapped[WRAP_PREFIX.len()..])
            .ok_or_else(|| ConfigError::Invalid { path: "<secret>".to_string() })?;
        if raw.len() < NONCE_LEN {
            return Err(ConfigError::Invalid { path: "<secret>".to_string() });
        }
        let (nonce_bytes, ct) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plain = cipher
            .decrypt(nonce, ct)
            .map_err(|_| ConfigError::SecretsLocked)?;
        let locked = crate::secure_memory::LockedVec::new(plain);
        Ok(serde_json::from_slice(locked.as_slice())?)
    }

    /// Transparently decrypts any declared secret path present in `merged` as
    /// a `wrapped:v1:...` string.
    fn unwrap_secrets(&self, merged: &mut Value) -> Result<(), ConfigError> {
        for path in &self.secret_paths {
            if let Some(v) = get_path(merged, path) {
                if let Value::String(s) = v {
                    if let Some(stripped) = s.strip_prefix(WRAP_PREFIX) {
                        let full = format!("{WRAP_PREFIX}{stripped}");
                        let decrypted = self.unwrap_secret(&full)?;
                        set_path(merged, path, decrypted);
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads the effective view of a single module's own config file, merged
    /// under env overrides prefixed `SUITE_MODULE_{MODULE_ID}_`.
    pub fn module_config(&self, module_id: &str) -> Result<Value, ConfigError> {
        let path = self.module_dir.join(format!("{module_id}_config.json"));
        let mut value = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Value::Object(Default::default())
        };
        let prefix = format!("SUITE_MODULE_{}_", module_id.to_uppercase());
        for (k, v) in std::env::vars() {
            if let Some(rest) = k.strip_prefix(&prefix) {
                set_path(&mut value, &rest.to_lowercase(), Value::String(v));
            }
        }
        Ok(value)
    }
}

fn load_or_create_wrapper_key(suite_path: &Path) -> Result<Option<Aes256Gcm>, ConfigError> {
    let keys_dir = suite_path
        .parent()
        .map(|p| p.join("keys"))
        .unwrap_or_else(|| PathBuf::from("data/keys"));
    let key_path = keys_dir.join("suite_wrapper.key");
    let bytes = if key_path.exists() {
        let raw = fs::read(&key_path)?;
        if raw.len() != KEY_LEN {
            return Ok(None);
        }
        raw
    } else {
        fs::create_dir_all(&keys_dir)?;
        let mut key = vec![0u8; KEY_LEN];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut key);
        atomic_write(&key_path, &key)?;
        key
    };
    let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| ConfigError::SecretsLocked)?;
    Ok(Some(Aes256Gcm::new_from_slice(&arr).expect("key length is 32")))
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn set_path(value: &mut Value, path: &str, new_value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = value;
    for (i, part) in parts.iter().enumerate() {
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        let obj = cur.as_object_mut().unwrap();
        if i == parts.len() - 1 {
            obj.insert(part.to_string(), new_value);
            return;
        }
        cur = obj.entry(part.to_string()).or_insert_with(|| Value::Object(Default::default()));
    }
}

fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                merge_json(base_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

fn apply_env_overrides(merged: &mut Value) {
    for (k, v) in std::env::vars() {
        if let Some(rest) = k.strip_prefix("SUITE_") {
            let path = rest.to_lowercase();
            let parsed: Value = serde_json::from_str(&v).unwrap_or(Value::String(v));
            set_path(merged, &path, parsed);
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ConfigStore {
        let mut secrets = HashSet::new();
        secrets.insert("cloud.auth_token".to_string());
        ConfigStore::open(dir.join("suite_config.json"), dir.join("modules"), secrets).unwrap()
    }

    #[test]
    fn defaults_apply_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        assert_eq!(store.get_or("http_port", 0u16), 5000);
    }

    #[test]
    fn set_persistent_then_reload_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.set("http_port", Value::from(6000), true).unwrap();
        store.reload().unwrap();
        assert_eq!(store.get_or("http_port", 0u16), 6000);
    }

    #[test]
    fn secret_round_trips_through_wrapper() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store
            .set("cloud.auth_token", Value::String("s3cr3t".to_string()), true)
            .unwrap();
        store.reload().unwrap();
        assert_eq!(
            store.get("cloud.auth_token"),
            Some(Value::String("s3cr3t".to_string()))
        );
        let on_disk = fs::read_to_string(tmp.path().join("suite_config.json")).unwrap();
        assert!(!on_disk.contains("s3cr3t"));
    }

    #[test]
    fn env_override_takes_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("SUITE_HTTP_PORT", "7000");
        let store = store(tmp.path());
        assert_eq!(store.get_or("http_port", 0u16), 7000);
        std::env::remove_var("SUITE_HTTP_PORT");
    }
}
