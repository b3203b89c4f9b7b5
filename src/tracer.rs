//! Flow tracer — rebuilds a per-flow tree from the action log for debugging
//! and observability.

use crate::log::{ActionLog, Record};
use crate::model::{ActionCompletion, ActionInvocation, Id};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Ok,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncEdgeTrace {
    pub sync: String,
    /// `Some` once the fired invocation's completion has appeared in the
    /// log; `None` while still in flight or if it never fires.
    pub result: Option<Box<TraceNode>>,
    pub unfired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unfired_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceNode {
    pub completion_id: Id,
    pub concept: String,
    pub action: String,
    pub variant: String,
    pub duration_ms: Option<i64>,
    pub edges: Vec<SyncEdgeTrace>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowTrace {
    pub flow_id: String,
    pub status: FlowStatus,
    pub root: TraceNode,
}

/// Filters applied when rendering a trace — `{failed: true}` elides `ok`
/// subtrees.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceFilter {
    pub failed_only: bool,
}

/// One candidate sync match that did not produce a firing invocation, with
/// why (degraded/unavailable/guard-blocked) — fed in by the caller from the
/// sync engine's per-round outcome, since the action log itself only
/// records successful edges.
#[derive(Debug, Clone)]
pub struct UnfiredEdge {
    pub trigger_completion_id: Id,
    pub sync: String,
    pub reason: String,
}

pub fn get_flow_trace(
    log: &dyn ActionLog,
    flow_id: &str,
    unfired: &[UnfiredEdge],
) -> Option<FlowTrace> {
    let records = log.load_flow(&flow_id.to_string());
    let completions: Vec<ActionCompletion> = records
        .iter()
        .filter_map(|r| match r {
            Record::Completion(c) => Some(c.clone()),
            Record::Invocation(_) => None,
        })
        .collect();

    let invocations_by_id: HashMap<Id, ActionInvocation> = records
        .iter()
        .filter_map(|r| match r {
            Record::Invocation(inv) => Some((inv.id.clone(), inv.clone())),
            Record::Completion(_) => None,
        })
        .collect();

    // Root = the Web/request completion, or the first completion in flow.
    let root_completion = completions
        .iter()
        .find(|c| c.concept == "Web" && c.action == "request")
        .or_else(|| completions.first())?
        .clone();

    // Sync-edge adjacency: a completion's id appears as `parent` on the
    // first invocation a sync produced; every invocation from that sync
    // shares `sync`. We reconstruct "children of completion X" as: every
    // completion whose originating invocation has `parent == X.id`.
    let completions_by_parent: HashMap<Id, Vec<&ActionCompletion>> = {
        let mut map: HashMap<Id, Vec<&ActionCompletion>> = HashMap::new();
        for c in &completions {
            if let Some(parent) = &c.parent {
                map.entry(parent.clone()).or_default().push(c);
            }
        }
        map
    };

    let mut visited = std::collections::HashSet::new();
    let root = build_node(
        &root_completion,
        &completions_by_parent,
        &invocations_by_id,
        unfired,
        &mut visited,
    );

    let status = compute_status(&completions, &root_completion);

    Some(FlowTrace {
        flow_id: flow_id.to_string(),
        status,
        root,
    })
}

fn build_node<'a>(
    completion: &ActionCompletion,
    by_parent: &HashMap<Id, Vec<&'a ActionCompletion>>,
    invocations_by_id: &HashMap<Id, ActionInvocation>,
    unfired: &[UnfiredEdge],
    visited: &mut std::collections::HashSet<Id>,
) -> TraceNode {
    visited.insert(completion.id.clone());

    let duration_ms = invocations_by_id
        .get(&completion.id)
        .and_then(|inv| duration_between(&inv.timestamp, &completion.timestamp));

    let mut edges = Vec::new();

    if let Some(children) = by_parent.get(&completion.id) {
        for child in children {
            if visited.contains(&child.id) {
                continue;
            }
            let sync_name = invocations_by_id
                .get(&child.id)
                .and_then(|inv| inv.sync.clone())
                .unwrap_or_default();
            let node = build_node(child, by_parent, invocations_by_id, unfired, visited);
            edges.push(SyncEdgeTrace {
                sync: sync_name,
                result: Some(Box::new(node)),
                unfired: false,
                unfired_reason: None,
            });
        }
    }

    for u in unfired.iter().filter(|u| u.trigger_completion_id == completion.id) {
        edges.push(SyncEdgeTrace {
            sync: u.sync.clone(),
            result: None,
            unfired: true,
            unfired_reason: Some(u.reason.clone()),
        });
    }

    TraceNode {
        completion_id: completion.id.clone(),
        concept: completion.concept.clone(),
        action: completion.action.clone(),
        variant: completion.variant.clone(),
        duration_ms,
        edges,
    }
}

fn duration_between(invoked_at: &str, completed_at: &str) -> Option<i64> {
    let start = chrono::DateTime::parse_from_rfc3339(invoked_at).ok()?;
    let end = chrono::DateTime::parse_from_rfc3339(completed_at).ok()?;
    Some((end - start).num_milliseconds().max(0))
}

fn compute_status(completions: &[ActionCompletion], root: &ActionCompletion) -> FlowStatus {
    let responder = completions
        .iter()
        .find(|c| c.concept == "Web" && c.action == "respond");
    let terminal = responder.unwrap_or(root);

    if terminal.is_error() || root.is_error() {
        return FlowStatus::Failed;
    }
    if completions.iter().all(|c| c.is_ok()) {
        FlowStatus::Ok
    } else {
        FlowStatus::Partial
    }
}

/// Renders a trace as an indented tree with status glyphs.
pub fn render_pretty(trace: &FlowTrace, filter: TraceFilter) -> String {
    let mut out = format!("flow {} [{}]\n", trace.flow_id, status_glyph(trace.status));
    render_node(&trace.root, 0, filter, &mut out);
    out
}

fn render_node(node: &TraceNode, depth: usize, filter: TraceFilter, out: &mut String) {
    let indent = "  ".repeat(depth);
    let glyph = if node.variant == "ok" { "✓" } else { "✗" };
    out.push_str(&format!(
        "{indent}{glyph} {}/{} ({}){}\n",
        node.concept,
        node.action,
        node.variant,
        node
            .duration_ms
            .map(|d| format!(" {d}ms"))
            .unwrap_or_default()
    ));
    for edge in &node.edges {
        if filter.failed_only {
            let subtree_ok = edge
                .result
                .as_ref()
                .map(|r| r.variant == "ok" && !has_failure(r))
                .unwrap_or(!edge.unfired);
            if subtree_ok {
                continue;
            }
        }
        match &edge.result {
            Some(child) => render_node(child, depth + 1, filter, out),
            None => {
                let reason = edge.unfired_reason.as_deref().unwrap_or("unknown");
                out.push_str(&format!(
                    "{}  ⊘ {} (unfired: {reason})\n",
                    indent, edge.sync
                ));
            }
        }
    }
}

fn has_failure(node: &TraceNode) -> bool {
    node.variant == "error" || node.edges.iter().any(|e| e.result.as_ref().map(has_failure).unwrap_or(e.unfired))
}

fn status_glyph(status: FlowStatus) -> &'static str {
    match status {
        FlowStatus::Ok => "✓",
        FlowStatus::Partial => "~",
        FlowStatus::Failed => "✗",
    }
}
