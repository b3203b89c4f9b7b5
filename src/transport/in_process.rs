//! In-process transport — calls the concept handler directly with a
//! provided `Storage`.

use super::{ConceptTransport, TransportResult};
use crate::model::{ActionCompletion, ActionInvocation};
use crate::storage::ConceptStorage;
use async_trait::async_trait;
use std::sync::Arc;

/// A concept's dispatch function: given an invocation and its storage,
/// produce the completion. Implementations match on `invocation.action`
/// and deserialize into the concept's own typed input; `ConceptHandler`
/// is the object-safe trait that collapses that split, so the registry
/// can hold any concept behind one pointer type.
#[async_trait]
pub trait ConceptHandler: Send + Sync {
    async fn handle(
        &self,
        invocation: ActionInvocation,
        storage: &dyn ConceptStorage,
    ) -> TransportResult<ActionCompletion>;
}

/// Adapts a plain async closure into a `ConceptHandler`, for concepts (like
/// the demo's Echo) that don't need the full types.rs/handler.rs/impl.rs
/// split.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ConceptHandler for FnHandler<F>
where
    F: Fn(ActionInvocation, &dyn ConceptStorage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = TransportResult<ActionCompletion>> + Send,
{
    async fn handle(
        &self,
        invocation: ActionInvocation,
        storage: &dyn ConceptStorage,
    ) -> TransportResult<ActionCompletion> {
        (self.0)(invocation, storage).await
    }
}

pub struct InProcessTransport {
    handler: Arc<dyn ConceptHandler>,
    storage: Arc<dyn ConceptStorage>,
}

impl InProcessTransport {
    pub fn new(handler: Arc<dyn ConceptHandler>, storage: Arc<dyn ConceptStorage>) -> Self {
        Self { handler, storage }
    }
}

#[async_trait]
impl ConceptTransport for InProcessTransport {
    async fn invoke(&self, invocation: ActionInvocation) -> TransportResult<ActionCompletion> {
        self.handler.handle(invocation, self.storage.as_ref()).await
    }

    async fn query(&self, request: super::ConceptQuery) -> TransportResult<Vec<serde_json::Value>> {
        self.storage.find(&request.relation, request.args.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::transport::stamp_completion;
    use std::collections::HashMap;

    #[tokio::test]
    async fn invoke_calls_handler_with_storage() {
        let storage: Arc<dyn ConceptStorage> = Arc::new(InMemoryStorage::new());
        let handler: Arc<dyn ConceptHandler> = Arc::new(FnHandler(|inv, storage| async move {
            storage
                .put("echo", &inv.id, serde_json::json!({"text": inv.input["text"]}))
                .await?;
            let mut output = HashMap::new();
            output.insert("echo".to_string(), inv.input["text"].clone());
            Ok(stamp_completion(&inv, "ok", output))
        }));
        let transport = InProcessTransport::new(handler, storage);

        let invocation = ActionInvocation {
            id: "i1".into(),
            concept: "Echo".into(),
            action: "send".into(),
            input: [("text".to_string(), serde_json::json!("hi"))].into_iter().collect(),
            flow: "f1".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            sync: None,
            parent: None,
        };
        let completion = transport.invoke(invocation).await.unwrap();
        assert_eq!(completion.variant, "ok");
        assert_eq!(completion.output["echo"], "hi");
    }
}
