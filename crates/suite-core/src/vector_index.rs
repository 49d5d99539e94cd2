//! Thin adapter over an external ANN/vector store. See spec §4.4.
//!
//! Mirrors the teacher's `VectorStore` trait shape
//! (`crates/pagi-core/src/knowledge/vector_store.rs`: async trait + `status()`
//! + a `Local*`/`Qdrant*` pair of implementations chosen by a factory). The
//! default implementation here (`FlatVectorIndex`) is the `"flat-like"`
//! backend named in spec §9's schema table: an in-process cosine-similarity
//! index persisted to `sled`, needing no external package. A `"chroma-like"`
//! backend would implement the same trait against an external service; none
//! ships in this core (embeddings/ANN engines are an external collaborator).

use crate::error::VectorError;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_TOP_K_CAP: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexStatus {
    pub connected: bool,
    pub backend: String,
    pub last_error: Option<String>,
}

/// Adapter over an external ANN/vector store. `top_k` is capped by the
/// implementation at `DEFAULT_TOP_K_CAP` unless configured otherwise.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, id: &str, text: &str, embedding: Vec<f32>, metadata: serde_json::Value) -> Result<(), VectorError>;
    async fn query(&self, embedding: &[f32], top_k: usize, filters: Option<&serde_json::Value>) -> Result<Vec<VectorHit>, VectorError>;
    async fn delete(&self, id: &str) -> Result<(), VectorError>;
    fn status(&self) -> VectorIndexStatus;
    /// Flushes and releases the backing store. Called once, at shutdown
    /// (spec §9: "each subsystem exposes a close/shutdown operation").
    fn close(&self) -> Result<(), VectorError>;
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredVector {
    text: String,
    embedding: Vec<f32>,
    metadata: serde_json::Value,
    #[allow(dead_code)]
    created_at: chrono::DateTime<Utc>,
}

/// Lazy: the backing `sled` tree is opened on first call, not on construction
/// (spec §4.4 "The adapter is lazy").
pub struct FlatVectorIndex {
    path: std::path::PathBuf,
    db: OnceLock<Mutex<Db>>,
    top_k_cap: usize,
}

impl FlatVectorIndex {
    pub fn new<P: AsRef<Path>>(path: P, top_k_cap: Option<usize>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            db: OnceLock::new(),
            top_k_cap: top_k_cap.unwrap_or(DEFAULT_TOP_K_CAP),
        }
    }

    fn db(&self) -> Result<&Mutex<Db>, VectorError> {
        if let Some(db) = self.db.get() {
            return Ok(db);
        }
        let opened = sled::open(&self.path).map_err(|e| VectorError::ConnectionFailed(e.to_string()))?;
        let _ = self.db.set(Mutex::new(opened));
        Ok(self.db.get().expect("just set"))
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    // Normalised to [0, 1], higher = more similar (spec §4.4).
    ((dot / (norm_a * norm_b)) + 1.0) / 2.0
}

#[async_trait]
impl VectorIndex for FlatVectorIndex {
    async fn upsert(&self, id: &str, text: &str, embedding: Vec<f32>, metadata: serde_json::Value) -> Result<(), VectorError> {
        let record = StoredVector { text: text.to_string(), embedding, metadata, created_at: Utc::now() };
        let bytes = serde_json::to_vec(&record).map_err(|e| VectorError::IndexingFailed(e.to_string()))?;
        let db = self.db()?.lock().unwrap();
        db.insert(id.as_bytes(), bytes).map_err(|e| VectorError::IndexingFailed(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, embedding: &[f32], top_k: usize, filters: Option<&serde_json::Value>) -> Result<Vec<VectorHit>, VectorError> {
        let top_k = top_k.min(self.top_k_cap);
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let db = self.db()?.lock().unwrap();
        let mut scored = Vec::new();
        for kv in db.iter() {
            let (k, v) = kv.map_err(|e| VectorError::QueryFailed(e.to_string()))?;
            let record: StoredVector = serde_json::from_slice(&v).map_err(|e| VectorError::QueryFailed(e.to_string()))?;
            if let Some(filters) = filters {
                if !metadata_matches(&record.metadata, filters) {
                    continue;
                }
            }
            let score = cosine_similarity(embedding, &record.embedding);
            scored.push(VectorHit {
                id: String::from_utf8_lossy(&k).to_string(),
                score,
                metadata: serde_json::json!({ "text": record.text, "metadata": record.metadata }),
            });
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete(&self, id: &str) -> Result<(), VectorError> {
        let db = self.db()?.lock().unwrap();
        db.remove(id.as_bytes()).map_err(|e| VectorError::IndexingFailed(e.to_string()))?;
        Ok(())
    }

    fn status(&self) -> VectorIndexStatus {
        let opened = self.db.get().is_some();
        VectorIndexStatus {
            connected: opened,
            backend: "flat-like".to_string(),
            last_error: None,
        }
    }

    fn close(&self) -> Result<(), VectorError> {
        if let Some(db) = self.db.get() {
            db.lock().unwrap().flush().map_err(|e| VectorError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn metadata_matches(candidate: &serde_json::Value, filters: &serde_json::Value) -> bool {
    let Some(filter_obj) = filters.as_object() else { return true };
    let Some(candidate_obj) = candidate.as_object() else { return false };
    filter_obj.iter().all(|(k, v)| candidate_obj.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_query_finds_closest_vector() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FlatVectorIndex::new(tmp.path().join("vectors"), None);
        index.upsert("a", "alpha", vec![1.0, 0.0], serde_json::json!({})).await.unwrap();
        index.upsert("b", "beta", vec![0.0, 1.0], serde_json::json!({})).await.unwrap();

        let hits = index.query(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn top_k_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FlatVectorIndex::new(tmp.path().join("vectors"), Some(2));
        for i in 0..5 {
            index.upsert(&format!("id{i}"), "t", vec![1.0, 0.0], serde_json::json!({})).await.unwrap();
        }
        let hits = index.query(&[1.0, 0.0], 50, None).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FlatVectorIndex::new(tmp.path().join("vectors"), None);
        index.upsert("a", "alpha", vec![1.0, 0.0], serde_json::json!({})).await.unwrap();
        index.delete("a").await.unwrap();
        let hits = index.query(&[1.0, 0.0], 10, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn lazily_opens_db() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FlatVectorIndex::new(tmp.path().join("vectors"), None);
        assert!(!index.status().connected);
    }

    #[test]
    fn close_on_a_never_opened_index_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FlatVectorIndex::new(tmp.path().join("vectors"), None);
        assert!(index.close().is_ok());
    }

    #[tokio::test]
    async fn close_flushes_an_opened_index() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FlatVectorIndex::new(tmp.path().join("vectors"), None);
        index.upsert("a", "alpha", vec![1.0, 0.0], serde_json::json!({})).await.unwrap();
        assert!(index.close().is_ok());
    }
}
