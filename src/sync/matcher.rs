//! Sync matcher + binder — candidate lookup, variable binding across `when`
//! patterns, `where`-clause evaluation, `then`-template expansion.
//!
//! Trigger-key lookup by `concept:action`, with bind/query/predicate
//! dispatch over a strongly-typed `Expr` AST for `where`-clause expressions.

use crate::log::{Record, ActionLog};
use crate::model::{
    ActionCompletion, ActionInvocation, BinOp, CompiledSync, Expr, FieldMatch, FieldPattern, Id,
    TemplateValue, ThenTemplate, WhenPattern, WhereClause,
};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub type Binding = HashMap<String, Value>;

/// Resolves cross-concept relation reads for `Query` where-clauses. The
/// kernel implements this over its `ConceptRegistry` + `LiteQueryManager`;
/// tests can stub it directly.
#[async_trait]
pub trait QueryResolver: Send + Sync {
    async fn query(
        &self,
        concept: &str,
        relation: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Value>, Box<dyn std::error::Error + Send + Sync>>;
}

/// One surviving binding for one candidate sync, ready to fire (or to be
/// guard-checked and skipped).
pub struct Match {
    pub sync_name: String,
    pub completion_ids: Vec<Id>,
    pub binding: Binding,
    pub binding_hash: String,
    pub flow: String,
    /// The triggering completion — `then` templates' first invocation gets
    /// `parent = trigger.id`.
    pub trigger_id: Id,
}

/// Finds every consistent binding for `sync` against `trigger`, using
/// `trigger.flow`'s completions in `log` to fill the sync's other `when`
/// slots (if any), then evaluates `where` and returns one `Match` per
/// surviving binding. Does not consult the firing guard — that's the
/// engine's job, since it must happen atomically with edge insertion.
pub async fn candidate_matches(
    sync: &CompiledSync,
    trigger: &ActionCompletion,
    log: &dyn ActionLog,
    resolver: &dyn QueryResolver,
) -> Vec<Match> {
    let flow_completions: Vec<ActionCompletion> = log
        .load_flow(&trigger.flow)
        .into_iter()
        .filter_map(|r| match r {
            Record::Completion(c) => Some(c),
            Record::Invocation(_) => None,
        })
        .collect();

    let mut out = Vec::new();
    for assignment in enumerate_assignments(&sync.when, trigger, &flow_completions) {
        let (completions, binding) = assignment;
        let bindings_after_where = evaluate_where(&sync.r#where, binding, resolver).await;
        for binding in bindings_after_where {
            let completion_ids: Vec<Id> = completions.iter().map(|c| c.id.clone()).collect();
            let binding_hash = hash_binding(&binding);
            out.push(Match {
                sync_name: sync.name.clone(),
                completion_ids,
                binding,
                binding_hash,
                flow: trigger.flow.clone(),
                trigger_id: trigger.id.clone(),
            });
        }
    }
    out
}

/// Backtracking search over tuples of completions, one per `when` pattern,
/// requiring `trigger` to fill at least one matching slot and every
/// position to bind consistently. Positions use distinct completions (spec
/// invariant 2: `|C| = |s.when|`).
fn enumerate_assignments(
    patterns: &[WhenPattern],
    trigger: &ActionCompletion,
    flow_completions: &[ActionCompletion],
) -> Vec<(Vec<ActionCompletion>, Binding)> {
    let mut results = Vec::new();
    let trigger_positions: Vec<usize> = patterns
        .iter()
        .enumerate()
        .filter(|(_, p)| bind_pattern(p, trigger, &mut Binding::new()))
        .map(|(i, _)| i)
        .collect();

    for start in trigger_positions {
        let mut used = vec![false; flow_completions.len()];
        let mut chosen: Vec<Option<ActionCompletion>> = vec![None; patterns.len()];
        chosen[start] = Some(trigger.clone());
        backtrack(
            patterns,
            0,
            start,
            trigger,
            flow_completions,
            &mut used,
            &mut chosen,
            Binding::new(),
            &mut results,
        );
    }

    // Multiple `start` choices (a sync whose `when` list repeats a pattern
    // shape) can produce identical assignments; dedup by completion id set
    // plus binding hash.
    let mut seen = std::collections::HashSet::new();
    results
        .into_iter()
        .filter(|(completions, binding)| {
            let mut ids: Vec<&str> = completions.iter().map(|c| c.id.as_str()).collect();
            ids.sort();
            let key = format!("{}::{}", ids.join(","), hash_binding(binding));
            seen.insert(key)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn backtrack(
    patterns: &[WhenPattern],
    position: usize,
    fixed_position: usize,
    trigger: &ActionCompletion,
    flow_completions: &[ActionCompletion],
    used: &mut Vec<bool>,
    chosen: &mut Vec<Option<ActionCompletion>>,
    binding: Binding,
    results: &mut Vec<(Vec<ActionCompletion>, Binding)>,
) {
    if position == patterns.len() {
        let completions: Vec<ActionCompletion> = chosen.iter().map(|c| c.clone().unwrap()).collect();
        results.push((completions, binding));
        return;
    }

    if position == fixed_position {
        let mut next_binding = binding.clone();
        if bind_pattern(&patterns[position], trigger, &mut next_binding) {
            backtrack(
                patterns,
                position + 1,
                fixed_position,
                trigger,
                flow_completions,
                used,
                chosen,
                next_binding,
                results,
            );
        }
        return;
    }

    for (idx, candidate) in flow_completions.iter().enumerate() {
        if used[idx] || candidate.id == trigger.id {
            continue;
        }
        let mut next_binding = binding.clone();
        if !bind_pattern(&patterns[position], candidate, &mut next_binding) {
            continue;
        }
        used[idx] = true;
        chosen[position] = Some(candidate.clone());
        backtrack(
            patterns,
            position + 1,
            fixed_position,
            trigger,
            flow_completions,
            used,
            chosen,
            next_binding,
            results,
        );
        chosen[position] = None;
        used[idx] = false;
    }
}

fn bind_pattern(pattern: &WhenPattern, completion: &ActionCompletion, binding: &mut Binding) -> bool {
    if pattern.concept != completion.concept || pattern.action != completion.action {
        return false;
    }
    if let Some(variant) = &pattern.variant {
        if variant != &completion.variant {
            return false;
        }
    }
    for field in &pattern.input_fields {
        if !bind_field_against(field, &completion.input, binding) {
            return false;
        }
    }
    for field in &pattern.output_fields {
        if !bind_field_against(field, &completion.output, binding) {
            return false;
        }
    }
    true
}

fn bind_field_against(
    field: &FieldPattern,
    source: &HashMap<String, Value>,
    binding: &mut Binding,
) -> bool {
    let value = source.get(&field.name).cloned().unwrap_or(Value::Null);
    match &field.matcher {
        FieldMatch::Wildcard => true,
        FieldMatch::Literal { value: expected } => expected == &value,
        FieldMatch::Variable { name } => match binding.get(name) {
            Some(existing) if existing != &value => false,
            _ => {
                binding.insert(name.clone(), value);
                true
            }
        },
    }
}

/// Evaluates `where` clauses in order, threading bindings through `Bind`,
/// multiplying them through `Query`, and filtering on `Predicate`.
async fn evaluate_where(
    clauses: &[WhereClause],
    initial: Binding,
    resolver: &dyn QueryResolver,
) -> Vec<Binding> {
    let mut bindings = vec![initial];

    for clause in clauses {
        let mut next = Vec::new();
        for binding in bindings {
            match clause {
                WhereClause::Bind { expr, r#as } => {
                    let mut b = binding;
                    let value = eval_expr(expr, &b);
                    b.insert(r#as.clone(), value);
                    next.push(b);
                }
                WhereClause::Predicate { expr } => {
                    if truthy(&eval_expr(expr, &binding)) {
                        next.push(binding);
                    }
                }
                WhereClause::Query {
                    concept,
                    relation,
                    filter,
                    bind_as,
                } => {
                    let filter_obj: serde_json::Map<String, Value> = filter
                        .iter()
                        .map(|(k, expr)| (k.clone(), eval_expr(expr, &binding)))
                        .collect();
                    let filter_value = if filter_obj.is_empty() {
                        None
                    } else {
                        Some(Value::Object(filter_obj))
                    };
                    let rows = resolver
                        .query(concept, relation, filter_value.as_ref())
                        .await
                        .unwrap_or_default();
                    for row in rows {
                        let mut b = binding.clone();
                        if let Some(name) = bind_as {
                            b.insert(name.clone(), row.clone());
                        }
                        if let Some(obj) = row.as_object() {
                            for (k, v) in obj {
                                b.insert(k.clone(), v.clone());
                            }
                        }
                        next.push(b);
                    }
                }
            }
        }
        bindings = next;
    }

    bindings
}

fn eval_expr(expr: &Expr, binding: &Binding) -> Value {
    match expr {
        Expr::Literal { value } => value.clone(),
        Expr::Var { name } => binding.get(name).cloned().unwrap_or(Value::Null),
        Expr::Call { name, args } => {
            let values: Vec<Value> = args.iter().map(|a| eval_expr(a, binding)).collect();
            eval_call(name, &values)
        }
        Expr::BinOp { op, left, right } => {
            let l = eval_expr(left, binding);
            let r = eval_expr(right, binding);
            eval_binop(*op, l, r)
        }
        Expr::Not { expr } => Value::Bool(!truthy(&eval_expr(expr, binding))),
    }
}

fn eval_call(name: &str, args: &[Value]) -> Value {
    match name {
        "uuid" => Value::String(uuid::Uuid::new_v4().to_string()),
        "concat" => Value::String(args.iter().map(value_to_string).collect::<Vec<_>>().join("")),
        "add" => numeric_fold(args, 0.0, |a, b| a + b),
        "sub" => numeric_fold(args, 0.0, |a, b| a - b),
        "mul" => numeric_fold(args, 1.0, |a, b| a * b),
        "div" => numeric_fold(args, 1.0, |a, b| if b == 0.0 { 0.0 } else { a / b }),
        // Builds a JSON object from alternating (key, value) args — the
        // `then`-template builtin used to nest bound variables into a
        // response body (e.g. `Web/respond`'s `body`).
        "object" => {
            let mut map = serde_json::Map::new();
            for pair in args.chunks(2) {
                if let [key, value] = pair {
                    if let Some(key) = key.as_str() {
                        map.insert(key.to_string(), value.clone());
                    }
                }
            }
            Value::Object(map)
        }
        _ => Value::Null,
    }
}

fn numeric_fold(args: &[Value], seed: f64, f: impl Fn(f64, f64) -> f64) -> Value {
    let mut iter = args.iter().map(|v| v.as_f64().unwrap_or(0.0));
    let mut acc = iter.next().unwrap_or(seed);
    for v in iter {
        acc = f(acc, v);
    }
    serde_json::Number::from_f64(acc)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn eval_binop(op: BinOp, left: Value, right: Value) -> Value {
    use BinOp::*;
    match op {
        Eq => Value::Bool(left == right),
        Ne => Value::Bool(left != right),
        Lt => Value::Bool(cmp_numeric(&left, &right, |a, b| a < b)),
        Le => Value::Bool(cmp_numeric(&left, &right, |a, b| a <= b)),
        Gt => Value::Bool(cmp_numeric(&left, &right, |a, b| a > b)),
        Ge => Value::Bool(cmp_numeric(&left, &right, |a, b| a >= b)),
        And => Value::Bool(truthy(&left) && truthy(&right)),
        Or => Value::Bool(truthy(&left) || truthy(&right)),
        Add => eval_call("add", &[left, right]),
        Sub => eval_call("sub", &[left, right]),
        Mul => eval_call("mul", &[left, right]),
        Div => eval_call("div", &[left, right]),
        Concat => eval_call("concat", &[left, right]),
    }
}

fn cmp_numeric(left: &Value, right: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expands a sync's `then` templates against a surviving binding into fresh
/// invocations: `sync = s.name`, `flow` inherited, fresh `id`s, `parent` set
/// to the trigger completion's id on the first invocation only.
pub fn expand_then(sync: &CompiledSync, m: &Match, now: &str) -> Vec<ActionInvocation> {
    sync.then
        .iter()
        .enumerate()
        .map(|(i, template)| build_invocation(template, &m.binding, &m.sync_name, &m.flow, m.trigger_id.clone(), i == 0, now))
        .collect()
}

fn build_invocation(
    template: &ThenTemplate,
    binding: &Binding,
    sync_name: &str,
    flow: &str,
    trigger_id: Id,
    is_first: bool,
    now: &str,
) -> ActionInvocation {
    let mut input = HashMap::new();
    for field in &template.fields {
        let value = match &field.value {
            TemplateValue::Literal { value } => value.clone(),
            TemplateValue::Variable { name } => binding.get(name).cloned().unwrap_or(Value::Null),
            TemplateValue::Template { expr } => eval_expr(expr, binding),
        };
        input.insert(field.name.clone(), value);
    }
    ActionInvocation {
        id: uuid::Uuid::new_v4().to_string(),
        concept: template.concept.clone(),
        action: template.action.clone(),
        input,
        flow: flow.to_string(),
        timestamp: now.to_string(),
        sync: Some(sync_name.to_string()),
        parent: if is_first { Some(trigger_id) } else { None },
    }
}

/// Deterministic hash of a binding map, used as the third component of the
/// firing-guard key so a sync that fires multiple times off the same
/// completion set (via `Query` multiplicity) gets one edge per distinct
/// binding.
pub fn hash_binding(binding: &Binding) -> String {
    let mut keys: Vec<&String> = binding.keys().collect();
    keys.sort();
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(binding[key].to_string().as_bytes());
        hasher.update(b";");
    }
    format!("{:x}", hasher.finalize())
}
