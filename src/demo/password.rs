// Password Concept Implementation (Rust)
//
// Purely computational validation plus a hashed-at-rest `set` action.
// SHA-256 of password + per-record random salt, both base64-encoded at rest.

use crate::demo::support::{completion_from_output, input_from_fields};
use crate::model::{ActionCompletion, ActionInvocation};
use crate::storage::{ConceptStorage, StorageResult};
use crate::transport::in_process::ConceptHandler;
use crate::transport::TransportResult;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

const MIN_LENGTH: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateInput {
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "variant")]
pub enum ValidateOutput {
    #[serde(rename = "ok")]
    Ok { valid: bool },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetInput {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "variant")]
pub enum SetOutput {
    #[serde(rename = "ok")]
    Ok { user: String },
    #[serde(rename = "error")]
    Error { message: String },
}

pub struct PasswordHandler;

impl PasswordHandler {
    /// No storage access — `validate` is purely computational.
    pub fn validate(&self, input: ValidateInput) -> ValidateOutput {
        ValidateOutput::Ok {
            valid: input.password.len() >= MIN_LENGTH,
        }
    }

    pub async fn set(&self, input: SetInput, storage: &dyn ConceptStorage) -> StorageResult<SetOutput> {
        if input.password.len() < MIN_LENGTH {
            return Ok(SetOutput::Error {
                message: "password too short".to_string(),
            });
        }
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut hasher = Sha256::new();
        hasher.update(input.password.as_bytes());
        hasher.update(&salt);
        let digest = BASE64.encode(hasher.finalize());
        storage
            .put(
                "password",
                &input.user,
                json!({ "user": input.user, "digest": digest, "salt": BASE64.encode(salt) }),
            )
            .await?;
        Ok(SetOutput::Ok { user: input.user })
    }
}

#[async_trait]
impl ConceptHandler for PasswordHandler {
    async fn handle(
        &self,
        invocation: ActionInvocation,
        storage: &dyn ConceptStorage,
    ) -> TransportResult<ActionCompletion> {
        match invocation.action.as_str() {
            "validate" => {
                let input: ValidateInput = input_from_fields(&invocation.input)?;
                let output = self.validate(input);
                Ok(completion_from_output(&invocation, output)?)
            }
            "set" => {
                let input: SetInput = input_from_fields(&invocation.input)?;
                let output = self.set(input, storage).await?;
                Ok(completion_from_output(&invocation, output)?)
            }
            other => Err(format!("Password has no action {other}").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[test]
    fn validate_rejects_short_password() {
        let handler = PasswordHandler;
        let out = handler.validate(ValidateInput { password: "short".into() });
        assert!(matches!(out, ValidateOutput::Ok { valid: false }));
    }

    #[test]
    fn validate_accepts_long_password() {
        let handler = PasswordHandler;
        let out = handler.validate(ValidateInput {
            password: "securepass123".into(),
        });
        assert!(matches!(out, ValidateOutput::Ok { valid: true }));
    }

    #[tokio::test]
    async fn set_stores_hashed_digest() {
        let storage = InMemoryStorage::new();
        let handler = PasswordHandler;
        let out = handler
            .set(
                SetInput {
                    user: "alice".into(),
                    password: "securepass123".into(),
                },
                &storage,
            )
            .await
            .unwrap();
        assert!(matches!(out, SetOutput::Ok { ref user } if user == "alice"));
        let row = storage.get("password", "alice").await.unwrap().unwrap();
        assert_ne!(row["digest"].as_str().unwrap(), "securepass123");
    }

    #[tokio::test]
    async fn set_rejects_short_password() {
        let storage = InMemoryStorage::new();
        let handler = PasswordHandler;
        let out = handler
            .set(
                SetInput {
                    user: "alice".into(),
                    password: "short".into(),
                },
                &storage,
            )
            .await
            .unwrap();
        assert!(matches!(out, SetOutput::Error { .. }));
    }
}
