//! Component error taxonomies (thiserror, teacher pattern: `knowledge/vector_store.rs::VectorError`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config path not found: {0}")]
    NotFound(String),
    #[error("config value at {path} has the wrong type")]
    Invalid { path: String },
    #[error("secrets wrapper key is not available")]
    SecretsLocked,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FactStoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("fact store is corrupted: {0}")]
    Corrupted(String),
}

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("indexing failed: {0}")]
    IndexingFailed(String),
    #[error("vector index not configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),
    #[error("no free port in configured range")]
    PortExhausted,
    #[error("module {0} did not become healthy within the startup budget")]
    StartTimeout(String),
    #[error("dependency {dependency} of {module} was not healthy")]
    DependencyUnmet { module: String, dependency: String },
    #[error("dependency cycle detected among: {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CloudBridgeError {
    #[error("cloud bridge is not configured")]
    NotConfigured,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("decrypt failed")]
    DecryptFailed,
    #[error("remote task error: {code}: {message}")]
    RemoteTaskError { code: String, message: String },
}

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("probe io error: {0}")]
    Io(#[from] std::io::Error),
}
