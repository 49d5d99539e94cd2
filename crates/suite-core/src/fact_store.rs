//! Keyed fact store with confidence, category, and timestamps. See spec §4.3.
//!
//! Embedded storage over `sled` (teacher: `crates/pagi-core/src/memory.rs`'s
//! `MemoryManager`), keyed `(user, key)`. A `DashMap` hot cache sits in front
//! of `sled` reads the same way `MemoryManager` caches tenant-scoped paths.

use crate::error::FactStoreError;
use crate::model::Fact;
use chrono::Utc;
use dashmap::DashMap;
use sled::Db;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_RECALL_LIMIT: usize = 10;
const MAX_RECALL_LIMIT: usize = 1000;
const DEFAULT_COMPACTION_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

fn record_key(user: &str, key: &str) -> Vec<u8> {
    format!("{user}\u{1}{key}").into_bytes()
}

fn user_prefix(user: &str) -> Vec<u8> {
    format!("{user}\u{1}").into_bytes()
}

/// Fact store. Single-writer (serialized through `sled`'s own transaction
/// semantics on a single tree), multi-reader (spec §5).
pub struct FactStore {
    db: Db,
    cache: DashMap<(String, String), Fact>,
    compaction_threshold_bytes: u64,
    writes_since_compaction_check: AtomicU64,
    last_write_at: DashMap<String, chrono::DateTime<Utc>>,
}

impl FactStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, FactStoreError> {
        let db = sled::open(path)?;
        if db.was_recovered() {
            tracing::debug!("fact store recovered from write-ahead log");
        }
        Ok(Self {
            db,
            cache: DashMap::new(),
            compaction_threshold_bytes: DEFAULT_COMPACTION_THRESHOLD_BYTES,
            writes_since_compaction_check: AtomicU64::new(0),
            last_write_at: DashMap::new(),
        })
    }

    /// Upserts `(user, key)`. Preserves `created_at` on update, advances
    /// `updated_at`. `ConflictingWrite` is resolved last-writer-wins: there is
    /// no separate error path, the newer call always wins (spec §4.3).
    pub fn remember(
        &self,
        user: &str,
        key: &str,
        value: &str,
        confidence: f32,
        category: &str,
    ) -> Result<Fact, FactStoreError> {
        let now = Utc::now();
        let rk = record_key(user, key);
        let existing = self.db.get(&rk)?;
        let created_at = match &existing {
            Some(bytes) => serde_json::from_slice::<Fact>(bytes)?.created_at,
            None => now,
        };
        let fact = Fact {
            user: user.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            category: category.to_string(),
            created_at,
            updated_at: now,
        };
        self.db.insert(&rk, serde_json::to_vec(&fact)?)?;
        self.cache.insert((user.to_string(), key.to_string()), fact.clone());
        self.last_write_at.insert(user.to_string(), now);
        self.maybe_compact()?;
        Ok(fact)
    }

    /// `key = None`: up to `limit` (default 10, capped at 1000) most recently
    /// updated facts for `user`, optionally filtered by `category`, ordered
    /// `(updated_at DESC, confidence DESC)` with ties by `key`. `key = Some`:
    /// a single record or `None`.
    pub fn recall(
        &self,
        user: &str,
        key: Option<&str>,
        limit: Option<usize>,
        category: Option<&str>,
    ) -> Result<Vec<Fact>, FactStoreError> {
        if let Some(key) = key {
            return Ok(self.recall_one(user, key)?.into_iter().collect());
        }
        let limit = limit.unwrap_or(DEFAULT_RECALL_LIMIT).min(MAX_RECALL_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut facts = Vec::new();
        for kv in self.db.scan_prefix(user_prefix(user)) {
            let (_, v) = kv?;
            let fact: Fact = serde_json::from_slice(&v)?;
            if let Some(category) = category {
                if fact.category != category {
                    continue;
                }
            }
            facts.push(fact);
        }
        facts.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.key.cmp(&b.key))
        });
        facts.truncate(limit);
        Ok(facts)
    }

    /// Convenience form of `recall` for the single-key case: one record or `None`.
    pub fn recall_one(&self, user: &str, key: &str) -> Result<Option<Fact>, FactStoreError> {
        let cache_key = (user.to_string(), key.to_string());
        if let Some(fact) = self.cache.get(&cache_key) {
            return Ok(Some(fact.clone()));
        }
        let rk = record_key(user, key);
        match self.db.get(&rk)? {
            Some(bytes) => {
                let fact: Fact = serde_json::from_slice(&bytes)?;
                self.cache.insert(cache_key, fact.clone());
                Ok(Some(fact))
            }
            None => Ok(None),
        }
    }

    /// `updated_at` of the most recent write for `user`, used by the context
    /// graph's cache-freshness check (spec §4.8 step 7).
    pub fn last_write_at(&self, user: &str) -> Option<chrono::DateTime<Utc>> {
        self.last_write_at.get(user).map(|v| *v)
    }

    pub fn forget(&self, user: &str, key: &str) -> Result<(), FactStoreError> {
        let rk = record_key(user, key);
        self.db.remove(&rk)?;
        self.cache.remove(&(user.to_string(), key.to_string()));
        Ok(())
    }

    /// `user = None` resets the whole store; otherwise only that user's facts.
    pub fn reset(&self, user: Option<&str>) -> Result<(), FactStoreError> {
        match user {
            None => {
                self.db.clear()?;
                self.cache.clear();
            }
            Some(user) => {
                let mut to_remove = Vec::new();
                for kv in self.db.scan_prefix(user_prefix(user)) {
                    let (k, _) = kv?;
                    to_remove.push(k.to_vec());
                }
                for k in to_remove {
                    self.db.remove(&k)?;
                }
                self.cache.retain(|(u, _), _| u != user);
            }
        }
        Ok(())
    }

    /// Distinct users with at least one stored fact, in no particular order.
    /// Used by the cloud bridge's auto-sync cycle to know who to push/pull
    /// for (spec §4.9: sync is per-user, like `recall`/`remember`).
    pub fn known_users(&self) -> Result<Vec<String>, FactStoreError> {
        let mut users = std::collections::HashSet::new();
        for kv in self.db.iter() {
            let (k, _) = kv?;
            if let Some(sep) = k.iter().position(|b| *b == 1u8) {
                if let Ok(user) = std::str::from_utf8(&k[..sep]) {
                    users.insert(user.to_string());
                }
            }
        }
        Ok(users.into_iter().collect())
    }

    pub fn close(&self) -> Result<(), FactStoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn maybe_compact(&self) -> Result<(), FactStoreError> {
        let n = self.writes_since_compaction_check.fetch_add(1, Ordering::Relaxed);
        if n % 100 != 0 {
            return Ok(());
        }
        if self.db.size_on_disk()? > self.compaction_threshold_bytes {
            tracing::info!("fact store exceeds compaction threshold; flushing to reclaim space");
            self.db.flush()?;
        }
        Ok(())
    }
}

/// Opens a fact store and treats any open failure as the fatal "Corrupted"
/// path of spec §4.3 / §7, since `sled::open` failing on an existing path
/// almost always means the on-disk format is unreadable.
pub fn open_or_fatal<P: AsRef<Path>>(path: P) -> Result<Arc<FactStore>, FactStoreError> {
    FactStore::open_path(path)
        .map(Arc::new)
        .map_err(|e| FactStoreError::Corrupted(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FactStore {
        let tmp = tempfile::tempdir().unwrap();
        FactStore::open_path(tmp.path().join("facts")).unwrap()
    }

    #[test]
    fn remember_then_recall_by_key_round_trips() {
        let store = store();
        store.remember("u1", "prefers_concise", "true", 0.9, "general").unwrap();
        let got = store.recall("u1", Some("prefers_concise"), None, None).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, "true");
        assert_eq!(got[0].confidence, 0.9);
    }

    #[test]
    fn remember_preserves_created_at_advances_updated_at() {
        let store = store();
        let first = store.remember("u1", "k", "a", 1.0, "general").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.remember("u1", "k", "b", 0.5, "general").unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.value, "b");
    }

    #[test]
    fn recall_limit_zero_is_empty_and_over_cap_is_clamped() {
        let store = store();
        for i in 0..5 {
            store.remember("u1", &format!("k{i}"), "v", 1.0, "general").unwrap();
        }
        assert_eq!(store.recall("u1", None, Some(0), None).unwrap().len(), 0);
        let capped = store.recall("u1", None, Some(10_000), None).unwrap();
        assert_eq!(capped.len(), 5);
    }

    #[test]
    fn recall_orders_by_updated_at_desc_then_confidence_then_key() {
        let store = store();
        store.remember("u1", "b", "v", 0.1, "general").unwrap();
        store.remember("u1", "a", "v", 0.9, "general").unwrap();
        let facts = store.recall("u1", None, Some(10), None).unwrap();
        assert_eq!(facts[0].key, "a");
    }

    #[test]
    fn forget_removes_the_fact() {
        let store = store();
        store.remember("u1", "k", "v", 1.0, "general").unwrap();
        store.forget("u1", "k").unwrap();
        assert!(store.recall("u1", Some("k"), None, None).unwrap().is_empty());
    }

    #[test]
    fn known_users_lists_distinct_users_only() {
        let store = store();
        store.remember("u1", "a", "v", 1.0, "general").unwrap();
        store.remember("u1", "b", "v", 1.0, "general").unwrap();
        store.remember("u2", "a", "v", 1.0, "general").unwrap();
        let mut users = store.known_users().unwrap();
        users.sort();
        assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn reset_user_only_clears_that_user() {
        let store = store();
        store.remember("u1", "k", "v", 1.0, "general").unwrap();
        store.remember("u2", "k", "v", 1.0, "general").unwrap();
        store.reset(Some("u1")).unwrap();
        assert!(store.recall("u1", Some("k"), None, None).unwrap().is_empty());
        assert!(!store.recall("u2", Some("k"), None, None).unwrap().is_empty());
    }
}
