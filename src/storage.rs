// Storage — Rust storage trait + in-memory implementation
//
// Mirrors the kernel's ConceptStorage interface. Each concept
// handler receives &dyn ConceptStorage.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub last_written_at: i64,
}

/// Storage interface the kernel exposes to concepts.
#[async_trait]
pub trait ConceptStorage: Send + Sync {
    async fn put(&self, relation: &str, key: &str, value: Value) -> StorageResult<()>;
    async fn get(&self, relation: &str, key: &str) -> StorageResult<Option<Value>>;
    async fn find(&self, relation: &str, criteria: Option<&Value>) -> StorageResult<Vec<Value>>;
    async fn del(&self, relation: &str, key: &str) -> StorageResult<()>;

    /// Last-written-at metadata for a key, if the backend tracks it.
    async fn get_meta(&self, _relation: &str, _key: &str) -> StorageResult<Option<RecordMeta>> {
        Ok(None)
    }
}

struct Row {
    value: Value,
    written_at: i64,
}

/// In-memory storage for testing and for the demo binary. Thread-safe via
/// Mutex; single-threaded-cooperative model means this is never truly
/// contended, only re-entrancy-safe.
pub struct InMemoryStorage {
    data: Mutex<HashMap<String, HashMap<String, Row>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConceptStorage for InMemoryStorage {
    async fn put(&self, relation: &str, key: &str, value: Value) -> StorageResult<()> {
        let mut data = self.data.lock().unwrap();
        let rel = data.entry(relation.to_string()).or_default();
        rel.insert(
            key.to_string(),
            Row {
                value,
                written_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        tracing::trace!(relation, key, "storage put");
        Ok(())
    }

    async fn get(&self, relation: &str, key: &str) -> StorageResult<Option<Value>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .get(relation)
            .and_then(|rel| rel.get(key))
            .map(|row| row.value.clone()))
    }

    async fn find(&self, relation: &str, criteria: Option<&Value>) -> StorageResult<Vec<Value>> {
        let data = self.data.lock().unwrap();
        let Some(rel) = data.get(relation) else {
            return Ok(vec![]);
        };

        let entries: Vec<Value> = rel.values().map(|row| row.value.clone()).collect();

        match criteria {
            None => Ok(entries),
            Some(crit) => {
                let crit_obj = crit.as_object();
                Ok(entries
                    .into_iter()
                    .filter(|entry| {
                        if let (Some(co), Some(eo)) = (crit_obj, entry.as_object()) {
                            co.iter().all(|(k, v)| eo.get(k) == Some(v))
                        } else {
                            false
                        }
                    })
                    .collect())
            }
        }
    }

    async fn del(&self, relation: &str, key: &str) -> StorageResult<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(rel) = data.get_mut(relation) {
            rel.remove(key);
        }
        tracing::trace!(relation, key, "storage del");
        Ok(())
    }

    async fn get_meta(&self, relation: &str, key: &str) -> StorageResult<Option<RecordMeta>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .get(relation)
            .and_then(|rel| rel.get(key))
            .map(|row| RecordMeta {
                last_written_at: row.written_at,
            }))
    }
}
