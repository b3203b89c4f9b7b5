//! Concept registry — maps concept URIs to transports; supports
//! `register`, `reloadConcept`, `deregisterConcept`, availability listeners.

use crate::transport::ConceptTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type AvailabilityListener = Box<dyn Fn(&str, bool) + Send + Sync>;

struct Entry {
    transport: Arc<dyn ConceptTransport>,
    available: bool,
}

/// Owns each registry entry; transports are shared references, so
/// in-flight invocations already dispatched to a transport keep running
/// even after `reloadConcept` swaps the entry.
#[derive(Default)]
pub struct ConceptRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    listeners: RwLock<Vec<AvailabilityListener>>,
}

impl ConceptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, uri: impl Into<String>, transport: Arc<dyn ConceptTransport>) {
        let uri = uri.into();
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                uri.clone(),
                Entry {
                    transport,
                    available: true,
                },
            );
        }
        self.notify(&uri, true).await;
    }

    /// Atomic swap; no completions are lost because only future invocations
    /// observe the new transport.
    pub async fn reload_concept(&self, uri: impl Into<String>, transport: Arc<dyn ConceptTransport>) {
        let uri = uri.into();
        let mut entries = self.entries.write().await;
        entries.insert(
            uri,
            Entry {
                transport,
                available: true,
            },
        );
    }

    pub async fn deregister_concept(&self, uri: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(uri).is_some()
        };
        if removed {
            self.notify(uri, false).await;
        }
        removed
    }

    pub async fn resolve(&self, uri: &str) -> Option<Arc<dyn ConceptTransport>> {
        let entries = self.entries.read().await;
        entries.get(uri).map(|e| e.transport.clone())
    }

    pub async fn available(&self, uri: &str) -> bool {
        let entries = self.entries.read().await;
        entries.get(uri).map(|e| e.available).unwrap_or(false)
    }

    /// Non-suspending availability check, for callers (like the distributed
    /// sync engine's undegrade pass) that need it from a synchronous
    /// closure. Registry mutations only ever happen between suspension
    /// points, so the lock is never actually contended here.
    pub fn available_sync(&self, uri: &str) -> bool {
        self.entries
            .try_read()
            .map(|entries| entries.get(uri).map(|e| e.available).unwrap_or(false))
            .unwrap_or(false)
    }

    pub async fn set_available(&self, uri: &str, available: bool) {
        let changed = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(uri) {
                Some(entry) if entry.available != available => {
                    entry.available = available;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(uri, available).await;
        }
    }

    pub async fn on_availability(&self, listener: AvailabilityListener) {
        self.listeners.write().await.push(listener);
    }

    async fn notify(&self, uri: &str, available: bool) {
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener(uri, available);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::in_process::{ConceptHandler, FnHandler, InProcessTransport};
    use crate::storage::InMemoryStorage;
    use crate::transport::stamp_completion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_transport() -> Arc<dyn ConceptTransport> {
        let storage = Arc::new(InMemoryStorage::new());
        let handler: Arc<dyn ConceptHandler> =
            Arc::new(FnHandler(|inv, _s| async move { Ok(stamp_completion(&inv, "ok", Default::default())) }));
        Arc::new(InProcessTransport::new(handler, storage))
    }

    #[tokio::test]
    async fn register_then_resolve() {
        let registry = ConceptRegistry::new();
        registry.register("Echo", noop_transport()).await;
        assert!(registry.resolve("Echo").await.is_some());
        assert!(registry.available("Echo").await);
    }

    #[tokio::test]
    async fn deregister_marks_unavailable_and_notifies() {
        let registry = ConceptRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        registry
            .on_availability(Box::new(move |_uri, available| {
                if !available {
                    calls2.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .await;

        registry.register("Echo", noop_transport()).await;
        assert!(registry.deregister_concept("Echo").await);
        assert!(!registry.available("Echo").await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reregistering_reemits_availability_true() {
        let registry = ConceptRegistry::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        registry
            .on_availability(Box::new(move |uri, available| {
                seen2.lock().unwrap().push((uri.to_string(), available));
            }))
            .await;

        registry.register("Echo", noop_transport()).await;
        registry.deregister_concept("Echo").await;
        registry.register("Echo", noop_transport()).await;

        let log = seen.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                ("Echo".to_string(), true),
                ("Echo".to_string(), false),
                ("Echo".to_string(), true),
            ]
        );
    }
}
