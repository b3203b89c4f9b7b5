//! Kernel dispatch loop — drives a request through invocation → transport
//! call → completion → sync evaluation → recursive invocations; assigns
//! flow ids; returns a response.
//!
//! `process_flow` is a work-counter-driven dispatch loop: each round drains
//! one completion, feeds it to the sync engine, and queues whatever
//! invocations come back for dispatch.

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::lite_query::LiteQueryManager;
use crate::log::{ActionLog, Record};
use crate::model::{ActionCompletion, ActionInvocation, CompiledSync, Fields};
use crate::registry::ConceptRegistry;
use crate::storage::ConceptStorage;
use crate::sync::matcher::QueryResolver;
use crate::sync::DistributedSyncEngine;
use crate::transport::in_process::{ConceptHandler, InProcessTransport};
use crate::transport::{stamp_completion, ConceptQuery, ConceptTransport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// The front door's response envelope.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Response {
    pub flow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resolves `Query` where-clauses through the lite-query manager, falling
/// back to the transport's own `query` when no lite-query adapter is
/// registered for that concept.
struct KernelResolver {
    lite_query: Arc<LiteQueryManager>,
    registry: Arc<ConceptRegistry>,
}

#[async_trait]
impl QueryResolver for KernelResolver {
    async fn query(
        &self,
        concept: &str,
        relation: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Value>, Box<dyn std::error::Error + Send + Sync>> {
        if self.lite_query.get(concept).is_some() {
            return self.lite_query.read(concept, relation, filter).await;
        }
        let Some(transport) = self.registry.resolve(concept).await else {
            return Ok(Vec::new());
        };
        transport
            .query(ConceptQuery {
                relation: relation.to_string(),
                args: filter.cloned(),
            })
            .await
    }
}

pub struct Kernel {
    pub registry: Arc<ConceptRegistry>,
    pub log: Arc<dyn ActionLog>,
    pub engine: Arc<DistributedSyncEngine>,
    pub lite_query: Arc<LiteQueryManager>,
    config: KernelConfig,
}

impl Kernel {
    pub fn new(
        registry: Arc<ConceptRegistry>,
        log: Arc<dyn ActionLog>,
        lite_query: Arc<LiteQueryManager>,
        config: KernelConfig,
    ) -> Self {
        let resolver: Arc<dyn QueryResolver> = Arc::new(KernelResolver {
            lite_query: lite_query.clone(),
            registry: registry.clone(),
        });
        let inner = crate::sync::SyncEngine::new(log.clone(), resolver);
        let engine = Arc::new(DistributedSyncEngine::new(
            "server",
            inner,
            registry.clone(),
            config.pending_max_age(),
        ));
        Self {
            registry,
            log,
            engine,
            lite_query,
            config,
        }
    }

    /// Wraps `handler` in an in-process transport unless the caller already
    /// built a transport (use `register_transport` directly for WS/SQS/
    /// Pub/Sub/HTTP concepts).
    pub async fn register_concept(
        &self,
        uri: impl Into<String>,
        handler: Arc<dyn ConceptHandler>,
        storage: Arc<dyn ConceptStorage>,
    ) {
        let transport = Arc::new(InProcessTransport::new(handler, storage));
        self.register_transport(uri, transport).await;
    }

    pub async fn register_transport(&self, uri: impl Into<String>, transport: Arc<dyn ConceptTransport>) {
        let uri = uri.into();
        self.registry.register(uri.clone(), transport).await;
        let restored = self
            .engine
            .undegrade_syncs_for_concept_sync(&uri, &self.registry);
        if !restored.is_empty() {
            tracing::info!(?restored, uri, "concept restored, undegrading syncs");
        }
        self.engine.on_availability_change(&uri, true, &now()).await;
    }

    pub async fn reload_concept(&self, uri: impl Into<String>, transport: Arc<dyn ConceptTransport>) {
        self.registry.reload_concept(uri, transport).await;
    }

    pub async fn deregister_concept(&self, uri: &str) -> bool {
        let removed = self.registry.deregister_concept(uri).await;
        if removed {
            let degraded = self.engine.degrade_syncs_for_concept(uri);
            if !degraded.is_empty() {
                tracing::warn!(?degraded, uri, "concept deregistered, degrading syncs");
            }
        }
        removed
    }

    pub fn register_sync(&self, sync: CompiledSync) {
        self.engine.register_sync(sync);
    }

    pub fn reload_syncs(&self, syncs: Vec<CompiledSync>) {
        self.engine.reload_syncs(syncs);
    }

    /// Direct call bypassing the sync engine — used for setup and queries.
    /// Still appended to the log so invariant 1 (every completion has a
    /// matching invocation) holds for every path through the kernel.
    pub async fn invoke_concept(
        &self,
        concept: impl Into<String>,
        action: impl Into<String>,
        input: Fields,
    ) -> ActionCompletion {
        let invocation = ActionInvocation {
            id: uuid::Uuid::new_v4().to_string(),
            concept: concept.into(),
            action: action.into(),
            input,
            flow: uuid::Uuid::new_v4().to_string(),
            timestamp: now(),
            sync: None,
            parent: None,
        };
        self.dispatch(&invocation).await
    }

    pub async fn query_concept(
        &self,
        uri: &str,
        relation: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Value>, Box<dyn std::error::Error + Send + Sync>> {
        if self.lite_query.get(uri).is_some() {
            return self.lite_query.read(uri, relation, filter).await;
        }
        let Some(transport) = self.registry.resolve(uri).await else {
            return Err(format!("no such concept: {uri}").into());
        };
        transport
            .query(ConceptQuery {
                relation: relation.to_string(),
                args: filter.cloned(),
            })
            .await
    }

    /// Front door: lifts `payload` into a synthetic `Web/request` completion
    /// and drives `process_flow` to quiescence or a `Web/respond`.
    pub async fn handle_request(&self, method: impl Into<String>, mut payload: Fields) -> Response {
        let flow_id = uuid::Uuid::new_v4().to_string();
        payload.insert("method".to_string(), Value::String(method.into()));

        let request_completion = ActionCompletion {
            id: uuid::Uuid::new_v4().to_string(),
            concept: "Web".to_string(),
            action: "request".to_string(),
            input: payload.clone(),
            variant: "ok".to_string(),
            output: payload,
            flow: flow_id.clone(),
            timestamp: now(),
            parent: None,
        };
        self.log.append(Record::Completion(request_completion.clone()));

        self.process_flow(flow_id, request_completion).await
    }

    async fn process_flow(&self, flow_id: String, seed: ActionCompletion) -> Response {
        let mut queue: VecDeque<ActionCompletion> = VecDeque::from([seed]);
        let mut rounds: u32 = 0;

        while let Some(completion) = queue.pop_front() {
            rounds += 1;
            if rounds > self.config.quiescence_budget {
                break;
            }

            let outcome = self.engine.on_completion(&completion, &now()).await;
            for invocation in outcome.invocations {
                if invocation.concept == "Web" && invocation.action == "respond" {
                    let response_completion = stamp_completion(&invocation, "ok", invocation.input.clone());
                    self.log.append(Record::Invocation(invocation.clone()));
                    self.log.append(Record::Completion(response_completion.clone()));
                    return Response {
                        flow_id,
                        body: response_completion.output.get("body").cloned(),
                        code: response_completion.output.get("code").and_then(|v| v.as_i64()),
                        error: response_completion
                            .output
                            .get("error")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                    };
                }
                let next = self.dispatch(&invocation).await;
                queue.push_back(next);
            }
        }

        let err = KernelError::Quiescence { flow: flow_id.clone() };
        Response {
            flow_id,
            body: None,
            code: None,
            error: Some(err.code().to_string()),
        }
    }

    async fn dispatch(&self, invocation: &ActionInvocation) -> ActionCompletion {
        self.log.append(Record::Invocation(invocation.clone()));

        let Some(transport) = self.registry.resolve(&invocation.concept).await else {
            let err = KernelError::UnknownConcept { uri: invocation.concept.clone() };
            let mut output = Fields::new();
            output.insert("message".to_string(), Value::String(err.to_string()));
            output.insert("code".to_string(), Value::String(err.code().to_string()));
            let completion = stamp_completion(invocation, "error", output);
            self.log.append(Record::Completion(completion.clone()));
            return completion;
        };

        let invoked = tokio::time::timeout(self.config.invocation_timeout(), transport.invoke(invocation.clone())).await;
        let completion = match invoked {
            Ok(Ok(completion)) => completion,
            Ok(Err(err)) => {
                self.registry.set_available(&invocation.concept, false).await;
                self.engine.degrade_syncs_for_concept(&invocation.concept);
                let mut output = Fields::new();
                output.insert("message".to_string(), Value::String(err.to_string()));
                stamp_completion(invocation, "error", output)
            }
            Err(_elapsed) => {
                let mut output = Fields::new();
                output.insert("message".to_string(), Value::String("timeout".to_string()));
                stamp_completion(invocation, "error", output)
            }
        };

        self.log.append(Record::Completion(completion.clone()));
        self.lite_query.invalidate(&invocation.concept);
        completion
    }
}

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::lite_query::LiteQueryManager;
    use crate::log::InMemoryActionLog;
    use crate::model::{Annotation, FieldMatch, FieldPattern, TemplateValue, ThenField, ThenTemplate, WhenPattern};
    use crate::transport::in_process::{ConceptHandler, FnHandler};
    use serde_json::json;

    fn new_kernel() -> Kernel {
        let registry = Arc::new(ConceptRegistry::new());
        let log: Arc<dyn ActionLog> = Arc::new(InMemoryActionLog::new());
        let lite_query = Arc::new(LiteQueryManager::new(KernelConfig::default().lite_query_ttl()));
        Kernel::new(registry, log, lite_query, KernelConfig::default())
    }

    fn echo_handler() -> Arc<dyn ConceptHandler> {
        Arc::new(FnHandler(|inv, _s: &dyn ConceptStorage| async move {
            let mut output = Fields::new();
            output.insert("echo".to_string(), inv.input["text"].clone());
            Ok(stamp_completion(&inv, "ok", output))
        }))
    }

    fn echo_syncs() -> Vec<CompiledSync> {
        vec![
            CompiledSync {
                name: "HandleEcho".into(),
                annotations: vec![Annotation::Eager],
                when: vec![WhenPattern {
                    concept: "Web".into(),
                    action: "request".into(),
                    input_fields: vec![FieldPattern {
                        name: "text".into(),
                        matcher: FieldMatch::Variable { name: "text".into() },
                    }],
                    output_fields: vec![],
                    variant: None,
                }],
                r#where: vec![],
                then: vec![ThenTemplate {
                    concept: "Echo".into(),
                    action: "send".into(),
                    fields: vec![ThenField {
                        name: "text".into(),
                        value: TemplateValue::Variable { name: "text".into() },
                    }],
                }],
            },
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
                    variant: Some("ok".into()),
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
            },
        ]
    }

    #[tokio::test]
    async fn handle_request_round_trips_through_syncs() {
        let kernel = new_kernel();
        kernel
            .register_concept("Echo", echo_handler(), Arc::new(crate::storage::InMemoryStorage::new()))
            .await;
        kernel.reload_syncs(echo_syncs());

        let mut payload = Fields::new();
        payload.insert("text".to_string(), json!("hi"));
        let response = kernel.handle_request("echo", payload).await;

        assert_eq!(response.body, Some(json!("hi")));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn handle_request_without_a_responder_times_out_to_quiescence() {
        let kernel = new_kernel();
        // No concepts, no syncs registered: the synthetic Web/request never
        // produces a Web/respond, so processFlow exhausts its queue.
        let mut payload = Fields::new();
        payload.insert("text".to_string(), json!("hi"));
        let response = kernel.handle_request("echo", payload).await;

        assert!(response.body.is_none());
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn invoke_concept_against_unknown_uri_returns_error_completion() {
        let kernel = new_kernel();
        let completion = kernel.invoke_concept("Nope", "doSomething", Fields::new()).await;
        assert_eq!(completion.variant, "error");
    }

    #[tokio::test]
    async fn invoke_concept_appends_both_invocation_and_completion_to_the_log() {
        let kernel = new_kernel();
        kernel
            .register_concept("Echo", echo_handler(), Arc::new(crate::storage::InMemoryStorage::new()))
            .await;

        let mut input = Fields::new();
        input.insert("text".to_string(), json!("direct"));
        let completion = kernel.invoke_concept("Echo", "send", input).await;

        assert_eq!(completion.variant, "ok");
        let records = kernel.log.load_flow(&completion.flow);
        assert_eq!(records.len(), 2);
        assert!(records[0].as_invocation().is_some());
        assert!(records[1].as_completion().is_some());
    }
}
