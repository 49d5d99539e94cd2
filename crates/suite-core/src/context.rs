//! Context graph: assembles a bounded per-query snapshot from facts, semantic
//! hits, module state, recent events, and an optional remote excerpt. See
//! spec §4.8.

use crate::fact_store::FactStore;
use crate::health::HealthMonitor;
use crate::model::{ContextBundle, ContextMetadata, Fact, SemanticHit};
use crate::registry::ModuleRegistry;
use crate::vector_index::VectorIndex;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use md5::{Digest, Md5};
use std::sync::Arc;

const DEFAULT_MIN_CONFIDENCE: f32 = 0.2;
const DEFAULT_RECENT_EVENTS: usize = 20;
const DEFAULT_CACHE_TTL_S: i64 = 3_600;
const DEFAULT_MAX_AGE_REMOTE_S: i64 = 24 * 3_600;
const DEFAULT_MAX_BUNDLE_BYTES: usize = 32 * 1024;

/// An injected text-embedding capability. No implementation ships in this
/// core (spec §1 Non-goals: "it does not implement ... the embedding model");
/// callers wire in whatever local/remote embedder they use.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Vec<f32>;
}

/// Implemented by the cloud bridge so the context graph can pull a peer's
/// latest bundle without a hard dependency on the bridge's transport details.
#[async_trait]
pub trait RemoteContextSource: Send + Sync {
    async fn pull_remote(&self, user: &str) -> Option<ContextBundle>;
    fn is_healthy(&self) -> bool;
}

#[derive(Clone, Default)]
pub struct ContextOptions {
    pub include_semantic: bool,
    pub include_remote: bool,
    pub top_k_facts: usize,
    pub top_k_semantic: usize,
    pub max_age_remote_seconds: i64,
    pub min_confidence: f32,
}

impl ContextOptions {
    pub fn defaults() -> Self {
        Self {
            include_semantic: true,
            include_remote: false,
            top_k_facts: 10,
            top_k_semantic: 5,
            max_age_remote_seconds: DEFAULT_MAX_AGE_REMOTE_S,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    fn cache_fingerprint(&self, user: &str, query: Option<&str>) -> String {
        let mut hasher = Md5::new();
        hasher.update(user.as_bytes());
        hasher.update(b"|");
        hasher.update(query.unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(self.top_k_facts.to_le_bytes());
        hasher.update(self.top_k_semantic.to_le_bytes());
        hasher.update([self.include_semantic as u8, self.include_remote as u8]);
        format!("{:x}", hasher.finalize())
    }
}

struct CachedBundle {
    bundle: ContextBundle,
    created_at: DateTime<Utc>,
}

/// Assembles context bundles and caches them keyed by `md5(user|query|options)`
/// with an explicit freshness invariant: any fact write for `user` newer than
/// the cached bundle's `created_at` invalidates it (spec §4.8 step 7).
pub struct ContextGraph {
    facts: Arc<FactStore>,
    vector_index: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    registry: Arc<ModuleRegistry>,
    health: Arc<HealthMonitor>,
    remote: Option<Arc<dyn RemoteContextSource>>,
    cache: DashMap<String, CachedBundle>,
    cache_ttl: ChronoDuration,
    max_bundle_bytes: usize,
}

impl ContextGraph {
    pub fn new(
        facts: Arc<FactStore>,
        vector_index: Option<Arc<dyn VectorIndex>>,
        embedder: Option<Arc<dyn Embedder>>,
        registry: Arc<ModuleRegistry>,
        health: Arc<HealthMonitor>,
        remote: Option<Arc<dyn RemoteContextSource>>,
    ) -> Self {
        Self {
            facts,
            vector_index,
            embedder,
            registry,
            health,
            remote,
            cache: DashMap::new(),
            cache_ttl: ChronoDuration::seconds(DEFAULT_CACHE_TTL_S),
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
        }
    }

    pub async fn build(&self, user: &str, query: Option<&str>, options: &ContextOptions, events_recent: Vec<crate::model::Event>) -> ContextBundle {
        let fingerprint = options.cache_fingerprint(user, query);
        let now = Utc::now();

        if let Some(cached) = self.cache.get(&fingerprint) {
            let fresh_enough = now - cached.created_at < self.cache_ttl;
            let no_newer_write = self
                .facts
                .last_write_at(user)
                .map(|t| t <= cached.created_at)
                .unwrap_or(true);
            if fresh_enough && no_newer_write {
                let mut bundle = cached.bundle.clone();
                bundle.metadata.cache_hit = true;
                bundle.metadata.cache_created_at = Some(cached.created_at);
                return bundle;
            }
        }

        let bundle = self.assemble(user, query, options, events_recent, now).await;
        self.cache.insert(fingerprint, CachedBundle { bundle: bundle.clone(), created_at: now });
        bundle
    }

    async fn assemble(
        &self,
        user: &str,
        query: Option<&str>,
        options: &ContextOptions,
        recent_events: Vec<crate::model::Event>,
        now: DateTime<Utc>,
    ) -> ContextBundle {
        let mut degraded = Vec::new();

        let facts = match self.facts.recall(user, None, Some(options.top_k_facts), None) {
            Ok(facts) => facts.into_iter().filter(|f| f.confidence >= options.min_confidence).collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(error = %e, "fact recall failed while building context");
                degraded.push("facts".to_string());
                Vec::new()
            }
        };

        let semantic_hits = if options.include_semantic && query.is_some() {
            self.semantic_hits(query.unwrap(), options, &facts, &mut degraded).await
        } else {
            Vec::new()
        };

        let module_status: std::collections::HashMap<String, crate::model::ModuleRuntimeRecord> =
            self.registry.snapshot().into_iter().map(|r| (r.module_id.clone(), r)).collect();
        let _ = self.health.snapshot();

        let mut recent_events = recent_events;
        recent_events.truncate(DEFAULT_RECENT_EVENTS.max(1));

        let remote_excerpt = if options.include_remote {
            match &self.remote {
                Some(remote) if remote.is_healthy() => match remote.pull_remote(user).await {
                    Some(remote_bundle) => {
                        let merged = merge_remote_context(&facts, &remote_bundle.facts, options.max_age_remote_seconds, now);
                        return self.bound_bundle(ContextBundle {
                            user: user.to_string(),
                            query: query.map(|q| q.to_string()),
                            timestamp: now,
                            facts: merged,
                            semantic_hits,
                            module_status,
                            recent_events,
                            remote_excerpt: Some(serde_json::to_value(&remote_bundle).unwrap_or(serde_json::Value::Null)),
                            metadata: ContextMetadata { degraded_sections: degraded, cache_hit: false, cache_created_at: None },
                        });
                    }
                    None => {
                        degraded.push("remote".to_string());
                        None
                    }
                },
                _ => None,
            }
        } else {
            None
        };

        self.bound_bundle(ContextBundle {
            user: user.to_string(),
            query: query.map(|q| q.to_string()),
            timestamp: now,
            facts,
            semantic_hits,
            module_status,
            recent_events,
            remote_excerpt,
            metadata: ContextMetadata { degraded_sections: degraded, cache_hit: false, cache_created_at: None },
        })
    }

    async fn semantic_hits(&self, query: &str, options: &ContextOptions, facts: &[Fact], degraded: &mut Vec<String>) -> Vec<SemanticHit> {
        let (Some(index), Some(embedder)) = (&self.vector_index, &self.embedder) else { return Vec::new() };
        let embedding = embedder.embed(query).await;
        match index.query(&embedding, options.top_k_semantic, None).await {
            Ok(hits) => {
                let fact_keys: std::collections::HashSet<&str> = facts.iter().map(|f| f.key.as_str()).collect();
                hits.into_iter()
                    .filter(|h| {
                        let key = h.metadata.get("metadata").and_then(|m| m.get("key")).and_then(|k| k.as_str());
                        key.map(|k| !fact_keys.contains(k)).unwrap_or(true)
                    })
                    .map(|h| SemanticHit {
                        id: h.id,
                        text: h.metadata.get("text").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
                        score: h.score,
                        key: h.metadata.get("metadata").and_then(|m| m.get("key")).and_then(|k| k.as_str()).map(|s| s.to_string()),
                        metadata: h.metadata,
                    })
                    .collect()
            }
            Err(e) => {
                tracing::warn!(error = %e, "semantic query failed while building context");
                degraded.push("semantic_hits".to_string());
                Vec::new()
            }
        }
    }

    /// Trims the bundle, in priority order `remote_excerpt → recent_events →
    /// semantic_hits → facts`, until its serialised size is within budget.
    fn bound_bundle(&self, mut bundle: ContextBundle) -> ContextBundle {
        let size_of = |b: &ContextBundle| serde_json::to_vec(b).map(|v| v.len()).unwrap_or(0);
        if size_of(&bundle) <= self.max_bundle_bytes {
            return bundle;
        }
        bundle.remote_excerpt = None;
        if size_of(&bundle) <= self.max_bundle_bytes {
            return bundle;
        }
        while size_of(&bundle) > self.max_bundle_bytes && !bundle.recent_events.is_empty() {
            bundle.recent_events.pop();
        }
        if size_of(&bundle) <= self.max_bundle_bytes {
            return bundle;
        }
        while size_of(&bundle) > self.max_bundle_bytes && !bundle.semantic_hits.is_empty() {
            bundle.semantic_hits.pop();
        }
        if size_of(&bundle) <= self.max_bundle_bytes {
            return bundle;
        }
        while size_of(&bundle) > self.max_bundle_bytes && !bundle.facts.is_empty() {
            bundle.facts.pop();
        }
        bundle
    }
}

/// Merges local and remote facts keyed by `(user, key)`: keep the record with
/// the larger `updated_at`; on a tie prefer higher confidence; ignore remote
/// facts older than `max_age_remote_seconds` (spec §4.8 step 6).
pub fn merge_remote_context(local: &[Fact], remote: &[Fact], max_age_remote_seconds: i64, now: DateTime<Utc>) -> Vec<Fact> {
    let mut by_key: std::collections::HashMap<(String, String), Fact> = local.iter().map(|f| ((f.user.clone(), f.key.clone()), f.clone())).collect();

    for remote_fact in remote {
        let age = now - remote_fact.updated_at;
        if age > ChronoDuration::seconds(max_age_remote_seconds) {
            continue;
        }
        let key = (remote_fact.user.clone(), remote_fact.key.clone());
        match by_key.get(&key) {
            None => {
                by_key.insert(key, remote_fact.clone());
            }
            Some(existing) => {
                let remote_wins = remote_fact.updated_at > existing.updated_at
                    || (remote_fact.updated_at == existing.updated_at && remote_fact.confidence > existing.confidence);
                if remote_wins {
                    by_key.insert(key, remote_fact.clone());
                }
            }
        }
    }
    by_key.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(key: &str, value: &str, confidence: f32, updated_at: DateTime<Utc>) -> Fact {
        Fact { user: "u".to_string(), key: key.to_string(), value: value.to_string(), confidence, category: "general".to_string(), created_at: updated_at, updated_at }
    }

    #[test]
    fn merge_prefers_newer_remote_fact() {
        let now = Utc::now();
        let local = vec![fact("k", "A", 0.5, now)];
        let remote = vec![fact("k", "B", 0.9, now + ChronoDuration::seconds(10))];
        let merged = merge_remote_context(&local, &remote, 24 * 3600, now + ChronoDuration::seconds(20));
        assert_eq!(merged[0].value, "B");
    }

    #[test]
    fn merge_ignores_stale_remote_fact() {
        let now = Utc::now();
        let local = vec![fact("k", "A", 0.5, now)];
        let remote = vec![fact("k", "B", 0.9, now - ChronoDuration::hours(25))];
        let merged = merge_remote_context(&local, &remote, 24 * 3600, now);
        assert_eq!(merged[0].value, "A");
    }

    #[test]
    fn merge_breaks_ties_by_confidence() {
        let now = Utc::now();
        let local = vec![fact("k", "A", 0.3, now)];
        let remote = vec![fact("k", "B", 0.9, now)];
        let merged = merge_remote_context(&local, &remote, 24 * 3600, now);
        assert_eq!(merged[0].value, "B");
    }

    #[test]
    fn cache_fingerprint_differs_on_query() {
        let opts = ContextOptions::defaults();
        let a = opts.cache_fingerprint("u", Some("hello"));
        let b = opts.cache_fingerprint("u", Some("world"));
        assert_ne!(a, b);
    }
}
