//! Lite-query adapter — caches relation snapshots with TTL; per-URI
//! invalidation on local writes.
//!
//! TTL/expiry bookkeeping via `max_age`/`expires_at` fields, tag-based
//! invalidation, applied to cross-concept relation snapshots rather than a
//! concept's own cached values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub as_of: String,
    pub relations: HashMap<String, Vec<Value>>,
}

#[async_trait]
pub trait LiteQueryProtocol: Send + Sync {
    async fn snapshot(&self) -> Result<Snapshot, Box<dyn std::error::Error + Send + Sync>>;

    async fn lookup(
        &self,
        _relation: &str,
        _key: &str,
    ) -> Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(None)
    }

    fn supports_lookup(&self) -> bool {
        false
    }
}

struct Cached {
    snapshot: Snapshot,
    fetched_at: chrono::DateTime<chrono::Utc>,
}

/// One adapter per remote concept URI, wrapping that concept's
/// `LiteQueryProtocol`.
pub struct LiteQueryAdapter {
    protocol: Box<dyn LiteQueryProtocol>,
    ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl LiteQueryAdapter {
    pub fn new(protocol: Box<dyn LiteQueryProtocol>, ttl: Duration) -> Self {
        Self {
            protocol,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Single-key lookup delegates straight to `lookup`, uncached.
    /// Otherwise serves from a fresh-enough cached snapshot, or refreshes.
    pub async fn read(
        &self,
        relation: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Value>, Box<dyn std::error::Error + Send + Sync>> {
        if self.protocol.supports_lookup() {
            if let Some(key) = single_key_filter(filter) {
                return Ok(self
                    .protocol
                    .lookup(relation, &key)
                    .await?
                    .into_iter()
                    .collect());
            }
        }

        let snapshot = self.current_snapshot().await?;
        let rows = snapshot.relations.get(relation).cloned().unwrap_or_default();
        Ok(filter_rows(rows, filter))
    }

    async fn current_snapshot(&self) -> Result<Snapshot, Box<dyn std::error::Error + Send + Sync>> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some(entry) = cached.as_ref() {
                let age = chrono::Utc::now() - entry.fetched_at;
                if age.to_std().unwrap_or(Duration::MAX) < self.ttl {
                    return Ok(entry.snapshot.clone());
                }
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<Snapshot, Box<dyn std::error::Error + Send + Sync>> {
        let snapshot = self.protocol.snapshot().await?;
        let mut cached = self.cached.lock().unwrap();
        *cached = Some(Cached {
            snapshot: snapshot.clone(),
            fetched_at: chrono::Utc::now(),
        });
        Ok(snapshot)
    }

    /// Drops the cached snapshot; invoked automatically whenever a local
    /// action completes for a relation this adapter tracks, and exposed
    /// directly for callers.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap() = None;
    }

    pub fn has_cached_snapshot(&self) -> bool {
        self.cached.lock().unwrap().is_some()
    }
}

/// One adapter per remote concept URI. Invalidation is per-URI: the kernel
/// calls `invalidate` whenever a local completion fires for that concept,
/// so the adapter's next read refreshes rather than serving stale state.
#[derive(Default)]
pub struct LiteQueryManager {
    ttl: Duration,
    adapters: Mutex<HashMap<String, Arc<LiteQueryAdapter>>>,
}

impl LiteQueryManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, uri: impl Into<String>, protocol: Box<dyn LiteQueryProtocol>) {
        let adapter = Arc::new(LiteQueryAdapter::new(protocol, self.ttl));
        self.adapters.lock().unwrap().insert(uri.into(), adapter);
    }

    pub fn get(&self, uri: &str) -> Option<Arc<LiteQueryAdapter>> {
        self.adapters.lock().unwrap().get(uri).cloned()
    }

    pub async fn read(
        &self,
        uri: &str,
        relation: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Value>, Box<dyn std::error::Error + Send + Sync>> {
        match self.get(uri) {
            Some(adapter) => adapter.read(relation, filter).await,
            None => Ok(Vec::new()),
        }
    }

    /// Drops the cached snapshot for `uri`, if this manager holds one.
    pub fn invalidate(&self, uri: &str) {
        if let Some(adapter) = self.get(uri) {
            adapter.invalidate();
        }
    }
}

fn single_key_filter(filter: Option<&Value>) -> Option<String> {
    let obj = filter?.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let (_, v) = obj.iter().next()?;
    Some(match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn filter_rows(rows: Vec<Value>, filter: Option<&Value>) -> Vec<Value> {
    let Some(filter) = filter else { return rows };
    let Some(criteria) = filter.as_object() else {
        return rows;
    };
    rows.into_iter()
        .filter(|row| {
            row.as_object()
                .map(|obj| criteria.iter().all(|(k, v)| obj.get(k) == Some(v)))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProtocol {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LiteQueryProtocol for CountingProtocol {
        async fn snapshot(&self) -> Result<Snapshot, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut relations = HashMap::new();
            relations.insert(
                "user".to_string(),
                vec![serde_json::json!({"user": "u1", "name": "alice"})],
            );
            Ok(Snapshot {
                as_of: chrono::Utc::now().to_rfc3339(),
                relations,
            })
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        struct Tracking(Arc<AtomicUsize>);
        #[async_trait]
        impl LiteQueryProtocol for Tracking {
            async fn snapshot(&self) -> Result<Snapshot, Box<dyn std::error::Error + Send + Sync>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Snapshot {
                    as_of: chrono::Utc::now().to_rfc3339(),
                    relations: HashMap::new(),
                })
            }
        }
        let adapter = LiteQueryAdapter::new(Box::new(Tracking(calls.clone())), Duration::from_secs(60));
        adapter.read("user", None).await.unwrap();
        adapter.read("user", None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manager_invalidates_per_uri() {
        let manager = LiteQueryManager::new(Duration::from_secs(60));
        manager.register(
            "User",
            Box::new(CountingProtocol {
                calls: AtomicUsize::new(0),
            }),
        );
        manager.read("User", "user", None).await.unwrap();
        assert!(manager.get("User").unwrap().has_cached_snapshot());
        manager.invalidate("User");
        assert!(!manager.get("User").unwrap().has_cached_snapshot());
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let protocol = CountingProtocol {
            calls: AtomicUsize::new(0),
        };
        let adapter = LiteQueryAdapter::new(Box::new(protocol), Duration::from_secs(60));
        adapter.read("user", None).await.unwrap();
        assert!(adapter.has_cached_snapshot());
        adapter.invalidate();
        assert!(!adapter.has_cached_snapshot());
    }

    #[tokio::test]
    async fn filters_rows_by_criteria() {
        let protocol = CountingProtocol {
            calls: AtomicUsize::new(0),
        };
        let adapter = LiteQueryAdapter::new(Box::new(protocol), Duration::from_secs(60));
        let rows = adapter
            .read("user", Some(&serde_json::json!({"user": "nope"})))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
