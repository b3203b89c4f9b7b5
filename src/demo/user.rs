// User Concept Implementation (Rust)
//
// Mirrors the TypeScript user.impl.ts — register action with
// uniqueness constraints on name and email.

use crate::demo::support::{completion_from_output, input_from_fields};
use crate::model::{ActionCompletion, ActionInvocation};
use crate::storage::{ConceptStorage, StorageResult};
use crate::transport::in_process::ConceptHandler;
use crate::transport::TransportResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInput {
    pub user: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant")]
pub enum RegisterOutput {
    #[serde(rename = "ok")]
    Ok { user: String },
    #[serde(rename = "error")]
    Error { message: String },
}

pub struct UserHandler;

impl UserHandler {
    pub async fn register(
        &self,
        input: RegisterInput,
        storage: &dyn ConceptStorage,
    ) -> StorageResult<RegisterOutput> {
        // Check for duplicate name
        let existing_by_name = storage
            .find("user", Some(&json!({ "name": input.name })))
            .await?;
        if !existing_by_name.is_empty() {
            return Ok(RegisterOutput::Error {
                message: "name already taken".to_string(),
            });
        }

        // Check for duplicate email
        let existing_by_email = storage
            .find("user", Some(&json!({ "email": input.email })))
            .await?;
        if !existing_by_email.is_empty() {
            return Ok(RegisterOutput::Error {
                message: "email already taken".to_string(),
            });
        }

        storage
            .put(
                "user",
                &input.user,
                json!({
                    "user": input.user,
                    "name": input.name,
                    "email": input.email,
                }),
            )
            .await?;

        Ok(RegisterOutput::Ok {
            user: input.user,
        })
    }
}

#[async_trait]
impl ConceptHandler for UserHandler {
    async fn handle(
        &self,
        invocation: ActionInvocation,
        storage: &dyn ConceptStorage,
    ) -> TransportResult<ActionCompletion> {
        match invocation.action.as_str() {
            "register" => {
                let input: RegisterInput = input_from_fields(&invocation.input)?;
                let output = self.register(input, storage).await?;
                Ok(completion_from_output(&invocation, output)?)
            }
            other => Err(format!("User has no action {other}").into()),
        }
    }
}
