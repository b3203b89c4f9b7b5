//! Core data model: actions, completions, syncs, and the structures a
//! compiled sync is built from.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type Id = String;
pub type Flow = String;
pub type Fields = HashMap<String, Value>;

/// An action about to run on a concept. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionInvocation {
    pub id: Id,
    pub concept: String,
    pub action: String,
    pub input: Fields,
    pub flow: Flow,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
}

/// The result of running an `ActionInvocation`. Shares `id` with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCompletion {
    pub id: Id,
    pub concept: String,
    pub action: String,
    pub input: Fields,
    pub variant: String,
    pub output: Fields,
    pub flow: Flow,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
}

impl ActionCompletion {
    pub fn is_ok(&self) -> bool {
        self.variant == "ok"
    }

    pub fn is_error(&self) -> bool {
        self.variant == "error"
    }
}

/// Provenance record: this exact completion set has already fired this sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SyncEdge {
    pub completion_ids: Vec<Id>,
    pub sync: String,
    /// Disambiguates multiple bindings firing the same sync off the same
    /// completion set.
    pub binding_hash: String,
}

impl SyncEdge {
    pub fn key(completion_ids: &[Id], sync: &str, binding_hash: &str) -> String {
        let mut sorted = completion_ids.to_vec();
        sorted.sort();
        format!("{}::{}::{}", sorted.join(","), sync, binding_hash)
    }
}

/// A sync's annotation, deciding how it behaves under partial availability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Annotation {
    Eager,
    Eventual,
    Local,
    Idempotent,
}

/// A matcher for one field of a `when` pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum FieldMatch {
    Literal { value: Value },
    Variable { name: String },
    Wildcard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldPattern {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: FieldMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WhenPattern {
    pub concept: String,
    pub action: String,
    #[serde(default)]
    pub input_fields: Vec<FieldPattern>,
    #[serde(default)]
    pub output_fields: Vec<FieldPattern>,
    /// Matched against `ActionCompletion::variant`; `None` matches any.
    #[serde(default)]
    pub variant: Option<String>,
}

/// A pre-compiled expression. The `.sync` source parser is external; by the
/// time a `CompiledSync` reaches the core, `uuid()`/arithmetic/string
/// builtins and variable references are already this AST.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Expr {
    Literal { value: Value },
    Var { name: String },
    Call { name: String, args: Vec<Expr> },
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not { expr: Box<Expr> },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Concat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum WhereClause {
    Bind { expr: Expr, r#as: String },
    /// Resolves `relation` on `concept` via the lite-query adapter, filtered
    /// by `filter` (each value an `Expr` evaluated against the current
    /// binding). Each returned row multiplies the binding: the row's own
    /// fields are merged flat into the binding namespace, and — if
    /// `bind_as` is set — the whole row is additionally bound under that
    /// name as a JSON object.
    Query {
        concept: String,
        relation: String,
        #[serde(default)]
        filter: HashMap<String, Expr>,
        #[serde(default)]
        bind_as: Option<String>,
    },
    Predicate { expr: Expr },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum TemplateValue {
    Literal { value: Value },
    Variable { name: String },
    Template { expr: Expr },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThenField {
    pub name: String,
    pub value: TemplateValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThenTemplate {
    pub concept: String,
    pub action: String,
    #[serde(default)]
    pub fields: Vec<ThenField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledSync {
    pub name: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub when: Vec<WhenPattern>,
    #[serde(default)]
    pub r#where: Vec<WhereClause>,
    pub then: Vec<ThenTemplate>,
}

impl CompiledSync {
    pub fn has_annotation(&self, a: Annotation) -> bool {
        self.annotations.contains(&a)
    }

    /// Effective distribution mode: `eager` is the default when none of
    /// eager/eventual/local is present.
    pub fn distribution_mode(&self) -> Annotation {
        if self.has_annotation(Annotation::Local) {
            Annotation::Local
        } else if self.has_annotation(Annotation::Eventual) {
            Annotation::Eventual
        } else {
            Annotation::Eager
        }
    }

    /// Every concept URI referenced by this sync's `then` templates —
    /// the set whose availability gates firing.
    pub fn target_concepts(&self) -> Vec<&str> {
        self.then.iter().map(|t| t.concept.as_str()).collect()
    }

    /// The index key for the sync's first `when` pattern (spec invariant 4:
    /// `SyncIndex[k]` contains exactly the syncs whose *first* `when`
    /// pattern matches `k`).
    pub fn index_key(&self) -> Option<String> {
        self.when.first().map(|p| sync_index_key(&p.concept, &p.action))
    }
}

pub fn sync_index_key(concept: &str, action: &str) -> String {
    format!("{}:{}", concept, action)
}

/// A queued firing awaiting target availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: Id,
    pub sync: String,
    pub binding: HashMap<String, Value>,
    pub flow: Flow,
    pub enqueued_at: String,
    pub trigger_completion_ids: Vec<Id>,
}
