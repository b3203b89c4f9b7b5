//! Action log — append-only record of invocations, completions, and sync
//! provenance edges. Two views over the same append
//! sequence: by flow, and by edge.

use crate::model::{ActionCompletion, ActionInvocation, Flow, Id};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum Record {
    Invocation(ActionInvocation),
    Completion(ActionCompletion),
}

impl Record {
    pub fn flow(&self) -> &str {
        match self {
            Record::Invocation(i) => &i.flow,
            Record::Completion(c) => &c.flow,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Invocation(i) => &i.id,
            Record::Completion(c) => &c.id,
        }
    }

    pub fn as_completion(&self) -> Option<&ActionCompletion> {
        match self {
            Record::Completion(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_invocation(&self) -> Option<&ActionInvocation> {
        match self {
            Record::Invocation(i) => Some(i),
            _ => None,
        }
    }
}

/// Durable backends must make `addSyncEdgeForMatch` an atomic conditional
/// put; failure of the condition is the normal no-fire path, not an error.
pub trait ActionLog: Send + Sync {
    fn append(&self, record: Record);
    fn load_flow(&self, flow: &Flow) -> Vec<Record>;
    fn has_sync_edge(&self, completion_ids: &[Id], sync: &str, binding_hash: &str) -> bool;
    /// Returns `true` if the edge was newly added (the firing guard passed),
    /// `false` if it already existed (another match/replica already fired).
    fn add_sync_edge_for_match(&self, completion_ids: &[Id], sync: &str, binding_hash: &str) -> bool;
    fn len(&self) -> usize;
    fn all(&self) -> Vec<Record>;
}

#[derive(Default)]
pub struct InMemoryActionLog {
    inner: Mutex<LogInner>,
}

#[derive(Default)]
struct LogInner {
    records: Vec<Record>,
    edges: HashSet<String>,
}

impl InMemoryActionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActionLog for InMemoryActionLog {
    fn append(&self, record: Record) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.push(record);
    }

    fn load_flow(&self, flow: &Flow) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| r.flow() == flow)
            .cloned()
            .collect()
    }

    fn has_sync_edge(&self, completion_ids: &[Id], sync: &str, binding_hash: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let key = crate::model::SyncEdge::key(completion_ids, sync, binding_hash);
        inner.edges.contains(&key)
    }

    fn add_sync_edge_for_match(&self, completion_ids: &[Id], sync: &str, binding_hash: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = crate::model::SyncEdge::key(completion_ids, sync, binding_hash);
        inner.edges.insert(key)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    fn all(&self) -> Vec<Record> {
        self.inner.lock().unwrap().records.clone()
    }
}

/// Groups a flow's records by completion id, for quick "has this id
/// completed" checks used by the matcher and the tracer.
pub fn completions_by_id(records: &[Record]) -> HashMap<Id, ActionCompletion> {
    records
        .iter()
        .filter_map(|r| r.as_completion())
        .map(|c| (c.id.clone(), c.clone()))
        .collect()
}
