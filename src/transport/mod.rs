//! Transport adapters — uniform `invoke`/`query`/`health` over in-process,
//! WebSocket, SQS, Pub/Sub, and HTTP.
//!
//! Each adapter wraps a handler or remote endpoint and turns
//! `invoke(ActionInvocation)` into a dispatch against it, stamping
//! `timestamp` with `chrono::Utc::now()` and copying
//! `id`/`flow`/`concept`/`action`/`input` onto the returned completion
//! unchanged.

pub mod http;
pub mod in_process;
pub mod pubsub;
pub mod sqs;
pub mod websocket;

use crate::model::{ActionCompletion, ActionInvocation};
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;

pub type TransportResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Clone, Default)]
pub struct ConceptQuery {
    pub relation: String,
    pub args: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub available: bool,
    pub latency_ms: Option<u64>,
}

/// Handler for unsolicited completions pushed by duplex transports (the
/// WebSocket adapter's `onPushCompletion`).
pub type PushCompletionHandler = Box<dyn Fn(ActionCompletion) + Send + Sync>;

#[async_trait]
pub trait ConceptTransport: Send + Sync {
    async fn invoke(&self, invocation: ActionInvocation) -> TransportResult<ActionCompletion>;

    /// Absent adapters force the kernel to route queries through `invoke` of
    /// a distinguished action — the default here does that by
    /// calling the `_query` action and interpreting its `rows` output field.
    async fn query(&self, request: ConceptQuery) -> TransportResult<Vec<Value>> {
        let invocation = ActionInvocation {
            id: uuid::Uuid::new_v4().to_string(),
            concept: String::new(),
            action: "_query".to_string(),
            input: [
                ("relation".to_string(), Value::String(request.relation)),
                ("args".to_string(), request.args.unwrap_or(Value::Null)),
            ]
            .into_iter()
            .collect(),
            flow: "query".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            sync: None,
            parent: None,
        };
        let completion = self.invoke(invocation).await?;
        Ok(completion
            .output
            .get("rows")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    async fn health(&self) -> TransportResult<Health> {
        Ok(Health {
            available: true,
            latency_ms: None,
        })
    }

    fn on_push_completion(&self, _handler: PushCompletionHandler) {}
}

pub fn stamp_completion(
    invocation: &ActionInvocation,
    variant: impl Into<String>,
    output: crate::model::Fields,
) -> ActionCompletion {
    ActionCompletion {
        id: invocation.id.clone(),
        concept: invocation.concept.clone(),
        action: invocation.action.clone(),
        input: invocation.input.clone(),
        variant: variant.into(),
        output,
        flow: invocation.flow.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        parent: invocation.parent.clone(),
    }
}
