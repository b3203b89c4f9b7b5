//! Sync engine — feeds completions to the matcher, honors firing guards,
//! returns invocations; tracks degraded syncs.

use crate::log::ActionLog;
use crate::model::{sync_index_key, ActionCompletion, ActionInvocation, CompiledSync};
use crate::sync::matcher::{candidate_matches, expand_then, QueryResolver};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// `SyncIndex` keys syncs by their *first* `when` pattern's
/// `(concept, action)`. A second, broader index (over every pattern
/// position) backs the matcher's candidate lookup, since a completion
/// can match a sync at any pattern position, not only the first.
struct Index {
    by_first_pattern: HashMap<String, Vec<Arc<CompiledSync>>>,
    by_any_pattern: HashMap<String, Vec<Arc<CompiledSync>>>,
    by_name: HashMap<String, Arc<CompiledSync>>,
}

impl Index {
    fn build(syncs: &[Arc<CompiledSync>]) -> Self {
        let mut by_first_pattern: HashMap<String, Vec<Arc<CompiledSync>>> = HashMap::new();
        let mut by_any_pattern: HashMap<String, Vec<Arc<CompiledSync>>> = HashMap::new();
        let mut by_name = HashMap::new();
        for sync in syncs {
            if let Some(key) = sync.index_key() {
                by_first_pattern.entry(key).or_default().push(sync.clone());
            }
            let mut seen_keys = HashSet::new();
            for pattern in &sync.when {
                let key = sync_index_key(&pattern.concept, &pattern.action);
                if seen_keys.insert(key.clone()) {
                    by_any_pattern.entry(key).or_default().push(sync.clone());
                }
            }
            by_name.insert(sync.name.clone(), sync.clone());
        }
        Self {
            by_first_pattern,
            by_any_pattern,
            by_name,
        }
    }
}

/// Why a candidate match didn't produce an invocation — used by the flow
/// tracer to label unfired sync edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfiredReason {
    Degraded,
    GuardBlocked,
}

pub struct SyncOutcome {
    pub invocations: Vec<ActionInvocation>,
    /// Sync names whose candidate match was suppressed this round, with why.
    pub unfired: Vec<(String, UnfiredReason)>,
}

pub struct SyncEngine {
    index: RwLock<Index>,
    degraded: RwLock<HashSet<String>>,
    log: Arc<dyn ActionLog>,
    resolver: Arc<dyn QueryResolver>,
}

impl SyncEngine {
    pub fn new(log: Arc<dyn ActionLog>, resolver: Arc<dyn QueryResolver>) -> Self {
        Self {
            index: RwLock::new(Index::build(&[])),
            degraded: RwLock::new(HashSet::new()),
            log,
            resolver,
        }
    }

    pub fn register_sync(&self, sync: CompiledSync) {
        let mut syncs: Vec<Arc<CompiledSync>> = self.all_syncs();
        syncs.push(Arc::new(sync));
        *self.index.write().unwrap() = Index::build(&syncs);
    }

    /// Atomically rebuilds the whole index; clears all degraded marks, same
    /// as a fresh registry view.
    pub fn reload_syncs(&self, syncs: Vec<CompiledSync>) {
        let arced: Vec<Arc<CompiledSync>> = syncs.into_iter().map(Arc::new).collect();
        *self.index.write().unwrap() = Index::build(&arced);
        self.degraded.write().unwrap().clear();
    }

    fn all_syncs(&self) -> Vec<Arc<CompiledSync>> {
        self.index.read().unwrap().by_name.values().cloned().collect()
    }

    pub fn degrade_syncs_for_concept(&self, uri: &str) -> Vec<String> {
        let affected: Vec<String> = self
            .all_syncs()
            .into_iter()
            .filter(|s| s.target_concepts().iter().any(|c| *c == uri))
            .map(|s| s.name.clone())
            .collect();
        let mut degraded = self.degraded.write().unwrap();
        for name in &affected {
            degraded.insert(name.clone());
        }
        affected
    }

    /// Restores a sync unless it still references another unavailable
    /// concept.
    pub fn undegrade_syncs_for_concept(&self, uri: &str, is_available: impl Fn(&str) -> bool) -> Vec<String> {
        let candidates: Vec<Arc<CompiledSync>> = self
            .all_syncs()
            .into_iter()
            .filter(|s| s.target_concepts().iter().any(|c| *c == uri))
            .collect();
        let mut restored = Vec::new();
        let mut degraded = self.degraded.write().unwrap();
        for sync in candidates {
            if !degraded.contains(&sync.name) {
                continue;
            }
            let still_blocked = sync
                .target_concepts()
                .into_iter()
                .any(|c| c != uri && !is_available(c));
            if !still_blocked {
                degraded.remove(&sync.name);
                restored.push(sync.name.clone());
            }
        }
        restored
    }

    pub fn is_sync_degraded(&self, name: &str) -> bool {
        self.degraded.read().unwrap().contains(name)
    }

    pub fn get_degraded_syncs(&self) -> Vec<String> {
        self.degraded.read().unwrap().iter().cloned().collect()
    }

    pub(crate) fn sync_by_name(&self, name: &str) -> Option<Arc<CompiledSync>> {
        self.index.read().unwrap().by_name.get(name).cloned()
    }

    pub(crate) fn log(&self) -> &Arc<dyn ActionLog> {
        &self.log
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn QueryResolver> {
        &self.resolver
    }

    /// Syncs whose *any* `when` pattern matches `(concept, action)` — the
    /// matcher's own lookup index, broader than the formal `SyncIndex`
    ///. Exposed to the distributed engine, which
    /// needs the same candidate set before it applies annotation semantics.
    pub(crate) fn candidates_for(&self, completion: &ActionCompletion) -> Vec<Arc<CompiledSync>> {
        let key = sync_index_key(&completion.concept, &completion.action);
        self.index
            .read()
            .unwrap()
            .by_any_pattern
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Runs the matcher for `completion`, skipping degraded syncs (warning
    /// once per skip), applying the firing guard, and expanding `then`
    /// templates for every surviving, newly-guarded binding. Invocation
    /// emission order follows sync-index-insertion order, then surviving
    /// binding order.
    pub async fn on_completion(&self, completion: &ActionCompletion, now: &str) -> SyncOutcome {
        let mut invocations = Vec::new();
        let mut unfired = Vec::new();

        for sync in self.candidates_for(completion) {
            if self.is_sync_degraded(&sync.name) {
                tracing::warn!(sync = %sync.name, "skipping degraded sync");
                unfired.push((sync.name.clone(), UnfiredReason::Degraded));
                continue;
            }

            let matches = candidate_matches(&sync, completion, self.log.as_ref(), self.resolver.as_ref()).await;
            for m in matches {
                if self.log.has_sync_edge(&m.completion_ids, &m.sync_name, &m.binding_hash) {
                    unfired.push((sync.name.clone(), UnfiredReason::GuardBlocked));
                    continue;
                }
                if !self
                    .log
                    .add_sync_edge_for_match(&m.completion_ids, &m.sync_name, &m.binding_hash)
                {
                    // Another caller/replica won the race between the check
                    // and the conditional insert — normal no-fire path.
                    unfired.push((sync.name.clone(), UnfiredReason::GuardBlocked));
                    continue;
                }
                invocations.extend(expand_then(&sync, &m, now));
            }
        }

        SyncOutcome { invocations, unfired }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{InMemoryActionLog, Record};
    use crate::model::{
        Annotation, FieldMatch, FieldPattern, TemplateValue, ThenField, ThenTemplate, WhenPattern,
    };
    use std::collections::HashMap as Map;

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

    fn echo_response_sync() -> CompiledSync {
        CompiledSync {
            name: "EchoResponse".into(),
            annotations: vec![Annotation::Eager],
            when: vec![WhenPattern {
                concept: "Echo".into(),
                action: "send".into(),
                input_fields: vec![],
                output_fields: vec![FieldPattern {
                    name: "echo".into(),
                    matcher: FieldMatch::Variable { name: "text".into() },
                }],
                variant: None,
            }],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Web".into(),
                action: "respond".into(),
                fields: vec![ThenField {
                    name: "body".into(),
                    value: TemplateValue::Variable { name: "text".into() },
                }],
            }],
        }
    }

    fn echo_completion(id: &str, text: &str) -> ActionCompletion {
        let mut output = Map::new();
        output.insert("echo".to_string(), serde_json::Value::String(text.into()));
        ActionCompletion {
            id: id.into(),
            concept: "Echo".into(),
            action: "send".into(),
            input: Map::new(),
            variant: "ok".into(),
            output,
            flow: "f1".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            parent: None,
        }
    }

    #[tokio::test]
    async fn on_completion_fires_matching_sync() {
        let log: Arc<dyn ActionLog> = Arc::new(InMemoryActionLog::new());
        let engine = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        engine.register_sync(echo_response_sync());

        let completion = echo_completion("c1", "hi");
        log.append(Record::Completion(completion.clone()));
        let outcome = engine.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        assert_eq!(outcome.invocations.len(), 1);
        assert_eq!(outcome.invocations[0].input["body"], serde_json::Value::String("hi".into()));
    }

    #[tokio::test]
    async fn firing_guard_prevents_double_fire() {
        let log: Arc<dyn ActionLog> = Arc::new(InMemoryActionLog::new());
        let engine = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        engine.register_sync(echo_response_sync());

        let completion = echo_completion("c1", "hi");
        log.append(Record::Completion(completion.clone()));

        let first = engine.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        let second = engine.on_completion(&completion, "2024-01-01T00:00:02Z").await;
        assert_eq!(first.invocations.len(), 1);
        assert_eq!(second.invocations.len(), 0);
        assert!(matches!(second.unfired[0].1, UnfiredReason::GuardBlocked));
    }

    #[tokio::test]
    async fn degraded_sync_is_skipped_and_restored() {
        let log: Arc<dyn ActionLog> = Arc::new(InMemoryActionLog::new());
        let engine = SyncEngine::new(log.clone(), Arc::new(NullResolver));
        engine.register_sync(echo_response_sync());
        engine.degrade_syncs_for_concept("Web");
        assert!(engine.is_sync_degraded("EchoResponse"));

        let completion = echo_completion("c1", "hi");
        log.append(Record::Completion(completion.clone()));
        let outcome = engine.on_completion(&completion, "2024-01-01T00:00:01Z").await;
        assert!(outcome.invocations.is_empty());
        assert!(matches!(outcome.unfired[0].1, UnfiredReason::Degraded));

        engine.undegrade_syncs_for_concept("Web", |_| true);
        assert!(!engine.is_sync_degraded("EchoResponse"));
    }

    #[tokio::test]
    async fn reload_syncs_clears_degraded_marks() {
        let log: Arc<dyn ActionLog> = Arc::new(InMemoryActionLog::new());
        let engine = SyncEngine::new(log, Arc::new(NullResolver));
        engine.register_sync(echo_response_sync());
        engine.degrade_syncs_for_concept("Web");
        assert!(engine.is_sync_degraded("EchoResponse"));

        engine.reload_syncs(vec![echo_response_sync()]);
        assert!(!engine.is_sync_degraded("EchoResponse"));
    }
}
