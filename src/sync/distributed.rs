//! Distributed sync engine — adds annotation semantics
//! (`eager`/`eventual`/`local`/`idempotent`), engine hierarchies, and a
//! pending queue that drains on availability changes.

use crate::log::Record;
use crate::model::{ActionCompletion, ActionInvocation, Annotation, CompiledSync, PendingEntry};
use crate::registry::ConceptRegistry;
use crate::sync::engine::SyncEngine;
use crate::sync::matcher::{candidate_matches, expand_then, hash_binding, Match};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Forwards every completion this engine processes onward — e.g. to an
/// external log shipper. Distinct from `upstream`, which is itself another
/// `DistributedSyncEngine`.
pub type CompletionForwarder = Box<dyn Fn(&ActionCompletion) + Send + Sync>;

pub struct DistributedSyncEngine {
    pub runtime_id: String,
    inner: SyncEngine,
    registry: Arc<ConceptRegistry>,
    pending: RwLock<Vec<PendingEntry>>,
    pending_max_age: Duration,
    upstream: Option<Arc<DistributedSyncEngine>>,
    forwarders: RwLock<Vec<CompletionForwarder>>,
}

pub struct DistributedOutcome {
    pub invocations: Vec<ActionInvocation>,
    pub enqueued: usize,
    pub dropped: usize,
}

impl DistributedSyncEngine {
    pub fn new(runtime_id: impl Into<String>, inner: SyncEngine, registry: Arc<ConceptRegistry>, pending_max_age: Duration) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            inner,
            registry,
            pending: RwLock::new(Vec::new()),
            pending_max_age,
            upstream: None,
            forwarders: RwLock::new(Vec::new()),
        }
    }

    pub fn with_upstream(mut self, upstream: Arc<DistributedSyncEngine>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn register_forwarder(&self, forwarder: CompletionForwarder) {
        self.forwarders.write().unwrap().push(forwarder);
    }

    pub fn register_sync(&self, sync: CompiledSync) {
        self.inner.register_sync(sync);
    }

    pub fn reload_syncs(&self, syncs: Vec<CompiledSync>) {
        self.inner.reload_syncs(syncs);
        // Dropping all pending on reload: a reloaded sync set may no longer
        // agree with a queued binding's shape.
        self.pending.write().unwrap().clear();
    }

    pub fn degrade_syncs_for_concept(&self, uri: &str) -> Vec<String> {
        self.inner.degrade_syncs_for_concept(uri)
    }

    /// Restores syncs referencing `uri` unless another of their targets is
    /// still unavailable, checked synchronously against `registry`; used by
    /// the kernel right after a registration/reload.
    pub fn undegrade_syncs_for_concept_sync(&self, uri: &str, registry: &ConceptRegistry) -> Vec<String> {
        self.inner
            .undegrade_syncs_for_concept(uri, |c| registry.available_sync(c))
    }

    pub fn is_sync_degraded(&self, name: &str) -> bool {
        self.inner.is_sync_degraded(name)
    }

    pub fn get_degraded_syncs(&self) -> Vec<String> {
        self.inner.get_degraded_syncs()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.read().unwrap().len()
    }

    async fn all_targets_available(&self, sync: &CompiledSync) -> bool {
        for target in sync.target_concepts() {
            if !self.registry.available(target).await {
                return false;
            }
        }
        true
    }

    /// Runs the matcher for `completion`, then applies annotation semantics
    /// before deciding to fire, drop, or enqueue each surviving binding.
    /// Forwards the completion to every registered forwarder and to
    /// `upstream`, if any, regardless of annotation.
    pub async fn on_completion(&self, completion: &ActionCompletion, now: &str) -> DistributedOutcome {
        let mut invocations = Vec::new();
        let mut enqueued = 0usize;
        let mut dropped = 0usize;

        for sync in self.inner.candidates_for(completion) {
            if self.is_sync_degraded(&sync.name) {
                tracing::warn!(sync = %sync.name, "skipping degraded sync");
                continue;
            }

            let matches = candidate_matches(
                &sync,
                completion,
                self.inner.log().as_ref(),
                self.inner.resolver().as_ref(),
            )
            .await;

            for m in matches {
                let mode = sync.distribution_mode();
                let idempotent = sync.has_annotation(Annotation::Idempotent);
                let available = self.all_targets_available(&sync).await;

                let already_fired = self
                    .inner
                    .log()
                    .has_sync_edge(&m.completion_ids, &m.sync_name, &m.binding_hash);
                if already_fired && !idempotent {
                    dropped += 1;
                    continue;
                }

                match mode {
                    Annotation::Local | Annotation::Eager => {
                        if available {
                            if self.acquire_guard(&m, idempotent) {
                                invocations.extend(expand_then(&sync, &m, now));
                            } else {
                                dropped += 1;
                            }
                        } else {
                            tracing::warn!(
                                sync = %sync.name,
                                mode = ?mode,
                                "target unavailable, dropping firing"
                            );
                            dropped += 1;
                        }
                    }
                    Annotation::Eventual => {
                        if available {
                            if self.acquire_guard(&m, idempotent) {
                                invocations.extend(expand_then(&sync, &m, now));
                            } else {
                                dropped += 1;
                            }
                        } else {
                            self.enqueue(&m, now);
                            enqueued += 1;
                        }
                    }
                    Annotation::Idempotent => unreachable!("distribution_mode never returns Idempotent"),
                }
            }
        }

        for forwarder in self.forwarders.read().unwrap().iter() {
            forwarder(completion);
        }
        if let Some(upstream) = &self.upstream {
            let outcome = Box::pin(upstream.on_completion(completion, now)).await;
            invocations.extend(outcome.invocations);
        }

        DistributedOutcome {
            invocations,
            enqueued,
            dropped,
        }
    }

    fn acquire_guard(&self, m: &Match, idempotent: bool) -> bool {
        let acquired = self
            .inner
            .log()
            .add_sync_edge_for_match(&m.completion_ids, &m.sync_name, &m.binding_hash);
        acquired || idempotent
    }

    fn enqueue(&self, m: &Match, now: &str) {
        let mut pending = self.pending.write().unwrap();
        let exists = pending.iter().any(|p| {
            p.sync == m.sync_name
                && p.trigger_completion_ids == m.completion_ids
        });
        if exists {
            return;
        }
        pending.push(PendingEntry {
            id: uuid::Uuid::new_v4().to_string(),
            sync: m.sync_name.clone(),
            binding: m.binding.clone(),
            flow: m.flow.clone(),
            enqueued_at: now.to_string(),
            trigger_completion_ids: m.completion_ids.clone(),
        });
    }

    fn find_completion(&self, id: &str) -> Option<ActionCompletion> {
        self.inner
            .log()
            .all()
            .into_iter()
            .find_map(|r| match r {
                Record::Completion(c) if c.id == id => Some(c),
                _ => None,
            })
    }

    /// Scans pending entries; for each whose sync's targets are now all
    /// available, re-checks the sync, re-binds against the current log,
    /// acquires the firing guard, and emits invocations. Entries whose
    /// triggering completions are no longer present (e.g. a truncated
    /// volatile log) are dropped with a warning.
    pub async fn on_availability_change(&self, uri: &str, available: bool, now: &str) -> Vec<ActionInvocation> {
        if !available {
            return Vec::new();
        }

        let candidates: Vec<PendingEntry> = {
            let pending = self.pending.read().unwrap();
            pending
                .iter()
                .filter(|p| self.inner.sync_by_name(&p.sync).map(|s| s.target_concepts().iter().any(|c| *c == uri)).unwrap_or(false))
                .cloned()
                .collect()
        };

        let mut fired = Vec::new();
        let mut drained_ids = Vec::new();

        for entry in candidates {
            let Some(sync) = self.inner.sync_by_name(&entry.sync) else {
                drained_ids.push(entry.id.clone());
                continue;
            };
            if !self.all_targets_available(&sync).await {
                continue;
            }

            let Some(trigger) = entry
                .trigger_completion_ids
                .iter()
                .find_map(|id| self.find_completion(id))
            else {
                tracing::warn!(sync = %entry.sync, "dropping pending entry: trigger completion missing from log");
                drained_ids.push(entry.id.clone());
                continue;
            };

            let matches = candidate_matches(
                &sync,
                &trigger,
                self.inner.log().as_ref(),
                self.inner.resolver().as_ref(),
            )
            .await;

            let target_hash = hash_binding(&entry.binding);
            let reproduced = matches.into_iter().find(|m| {
                let mut a = m.completion_ids.clone();
                a.sort();
                let mut b = entry.trigger_completion_ids.clone();
                b.sort();
                a == b && m.binding_hash == target_hash
            });

            match reproduced {
                Some(m) => {
                    if self.acquire_guard(&m, sync.has_annotation(Annotation::Idempotent)) {
                        fired.extend(expand_then(&sync, &m, now));
                    }
                    drained_ids.push(entry.id.clone());
                }
                None => {
                    tracing::warn!(sync = %entry.sync, "dropping pending entry: binding no longer reproduces");
                    drained_ids.push(entry.id.clone());
                }
            }
        }

        if !drained_ids.is_empty() {
            let mut pending = self.pending.write().unwrap();
            pending.retain(|p| !drained_ids.contains(&p.id));
        }

        fired
    }

    /// Evicts pending entries older than `pending_max_age`, regardless of
    /// availability.
    pub fn evict_expired(&self, now: chrono::DateTime<chrono::Utc>) {
        let max_age = self.pending_max_age;
        self.pending.write().unwrap().retain(|entry| {
            match chrono::DateTime::parse_from_rfc3339(&entry.enqueued_at) {
                Ok(enqueued) => {
                    let age = now.signed_duration_since(enqueued.with_timezone(&chrono::Utc));
                    age.to_std().map(|d| d < max_age).unwrap_or(false)
                }
                Err(_) => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryActionLog;
    use crate::model::{Annotation, FieldMatch, FieldPattern, TemplateValue, ThenField, ThenTemplate, WhenPattern};
    use crate::sync::matcher::QueryResolver;
    use crate::transport::in_process::{ConceptHandler, FnHandler, InProcessTransport};
    use crate::transport::stamp_completion;
    use crate::storage::InMemoryStorage;
    use std::collections::HashMap;

    struct NullResolver;
    #[async_trait::async_trait]
    impl QueryResolver for NullResolver {
        async fn query(
            &self,
            _concept: &str,
            _relation: &str,
            _filter: Option<&serde_json::Value>,
        ) -> Result<Vec<serde_json::Value>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(vec![])
        }
    }

    fn replicate_sync() -> CompiledSync {
        CompiledSync {
            name: "SyncToServer".into(),
            annotations: vec![Annotation::Eventual],
            when: vec![WhenPattern {
                concept: "Profile".into(),
                action: "update".into(),
                input_fields: vec![FieldPattern {
                    name: "id".into(),
                    matcher: FieldMatch::Variable { name: "id".into() },
                }],
                output_fields: vec![],
                variant: None,
            }],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "ServerProfile".into(),
                action: "replicate".into(),
                fields: vec![ThenField {
                    name: "id".into(),
                    value: TemplateValue::Variable { name: "id".into() },
                }],
            }],
        }
    }

    fn profile_update(id: &str) -> ActionCompletion {
        let mut input = HashMap::new();
        input.insert("id".to_string(), serde_json::Value::String("p1".into()));
        ActionCompletion {
            id: id.into(),
            concept: "Profile".into(),
            action: "update".into(),
            input,
            variant: "ok".into(),
            output: HashMap::new(),
            flow: "f1".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            parent: None,
        }
    }

    fn noop_transport() -> Arc<dyn crate::transport::ConceptTransport> {
        let storage = Arc::new(InMemoryStorage::new());
        let handler: Arc<dyn ConceptHandler> =
            Arc::new(FnHandler(|inv, _s| async move { Ok(stamp_completion(&inv, "ok", Default::default())) }));
        Arc::new(InProcessTransport::new(handler, storage))
    }

    #[tokio::test]
    async fn eventual_sync_enqueues_when_target_unavailable() {
        let log: Arc<dyn crate::log::ActionLog> = Arc::new(InMemoryActionLog::new());
        let registry = Arc::new(ConceptRegistry::new());
        let inner = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        inner.register_sync(replicate_sync());
        let engine = DistributedSyncEngine::new("server", inner, registry.clone(), Duration::from_secs(86400));

        let completion = profile_update("c1");
        log.append(Record::Completion(completion.clone()));
        let outcome = engine.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        assert_eq!(outcome.invocations.len(), 0);
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(engine.pending_len(), 1);

        registry.register("ServerProfile", noop_transport()).await;
        let drained = engine.on_availability_change("ServerProfile", true, "2024-01-01T00:00:02Z").await;
        assert_eq!(drained.len(), 1);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn eventual_sync_fires_immediately_when_available() {
        let log: Arc<dyn crate::log::ActionLog> = Arc::new(InMemoryActionLog::new());
        let registry = Arc::new(ConceptRegistry::new());
        registry.register("ServerProfile", noop_transport()).await;
        let inner = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        inner.register_sync(replicate_sync());
        let engine = DistributedSyncEngine::new("server", inner, registry, Duration::from_secs(86400));

        let completion = profile_update("c1");
        log.append(Record::Completion(completion.clone()));
        let outcome = engine.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        assert_eq!(outcome.invocations.len(), 1);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn eager_sync_drops_silently_when_unavailable() {
        let log: Arc<dyn crate::log::ActionLog> = Arc::new(InMemoryActionLog::new());
        let registry = Arc::new(ConceptRegistry::new());
        let mut sync = replicate_sync();
        sync.annotations = vec![Annotation::Eager];
        let inner = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        inner.register_sync(sync);
        let engine = DistributedSyncEngine::new("server", inner, registry, Duration::from_secs(86400));

        let completion = profile_update("c1");
        log.append(Record::Completion(completion.clone()));
        let outcome = engine.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        assert_eq!(outcome.invocations.len(), 0);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn reload_drops_pending() {
        let log: Arc<dyn crate::log::ActionLog> = Arc::new(InMemoryActionLog::new());
        let registry = Arc::new(ConceptRegistry::new());
        let inner = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        inner.register_sync(replicate_sync());
        let engine = DistributedSyncEngine::new("server", inner, registry, Duration::from_secs(86400));

        let completion = profile_update("c1");
        log.append(Record::Completion(completion.clone()));
        engine.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        assert_eq!(engine.pending_len(), 1);

        engine.reload_syncs(vec![replicate_sync()]);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn forwards_completions_to_upstream() {
        let log: Arc<dyn crate::log::ActionLog> = Arc::new(InMemoryActionLog::new());
        let registry = Arc::new(ConceptRegistry::new());
        registry.register("ServerProfile", noop_transport()).await;

        let upstream_inner = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        upstream_inner.register_sync(replicate_sync());
        let upstream = Arc::new(DistributedSyncEngine::new("server", upstream_inner, registry.clone(), Duration::from_secs(86400)));

        let local_inner = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        let local = DistributedSyncEngine::new("ios", local_inner, registry, Duration::from_secs(86400))
            .with_upstream(upstream);

        let completion = profile_update("c1");
        log.append(Record::Completion(completion.clone()));
        let outcome = local.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        assert_eq!(outcome.invocations.len(), 1);
    }
}
