// Token Concept Implementation (Rust)
//
// Issues an opaque session token for a user, reduced to a single
// `generate` action.

use crate::demo::support::{completion_from_output, input_from_fields};
use crate::model::{ActionCompletion, ActionInvocation};
use crate::storage::{ConceptStorage, StorageResult};
use crate::transport::in_process::ConceptHandler;
use crate::transport::TransportResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateInput {
    pub user: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "variant")]
pub enum GenerateOutput {
    #[serde(rename = "ok")]
    Ok { user: String, token: String },
}

pub struct TokenHandler;

impl TokenHandler {
    pub async fn generate(&self, input: GenerateInput, storage: &dyn ConceptStorage) -> StorageResult<GenerateOutput> {
        let token = uuid::Uuid::new_v4().to_string();
        storage
            .put("token", &token, json!({ "user": input.user, "token": token }))
            .await?;
        Ok(GenerateOutput::Ok {
            user: input.user,
            token,
        })
    }
}

#[async_trait]
impl ConceptHandler for TokenHandler {
    async fn handle(
        &self,
        invocation: ActionInvocation,
        storage: &dyn ConceptStorage,
    ) -> TransportResult<ActionCompletion> {
        match invocation.action.as_str() {
            "generate" => {
                let input: GenerateInput = input_from_fields(&invocation.input)?;
                let output = self.generate(input, storage).await?;
                Ok(completion_from_output(&invocation, output)?)
            }
            other => Err(format!("Token has no action {other}").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn generate_returns_a_token() {
        let storage = InMemoryStorage::new();
        let handler = TokenHandler;
        let out = handler
            .generate(GenerateInput { user: "alice".into() }, &storage)
            .await
            .unwrap();
        match out {
            GenerateOutput::Ok { user, token } => {
                assert_eq!(user, "alice");
                assert!(!token.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn generate_produces_distinct_tokens() {
        let storage = InMemoryStorage::new();
        let handler = TokenHandler;
        let GenerateOutput::Ok { token: t1, .. } = handler
            .generate(GenerateInput { user: "alice".into() }, &storage)
            .await
            .unwrap();
        let GenerateOutput::Ok { token: t2, .. } = handler
            .generate(GenerateInput { user: "alice".into() }, &storage)
            .await
            .unwrap();
        assert_ne!(t1, t2);
    }
}
