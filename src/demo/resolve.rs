// Resolve Concept Implementation (Rust)
//
// Purely computational multi-value conflict resolution: given the
// candidate values seen for a key, returns a deterministic, order-independent
// resolution (sorted). The candidate-sorting strategy mirrors a
// last-writer-wins register resolved independent of observation order.

use crate::demo::support::{completion_from_output, input_from_fields};
use crate::model::{ActionCompletion, ActionInvocation};
use crate::storage::ConceptStorage;
use crate::transport::in_process::ConceptHandler;
use crate::transport::TransportResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct AttemptResolveInput {
    pub v1: String,
    pub v2: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "variant")]
pub enum AttemptResolveOutput {
    #[serde(rename = "ok")]
    Ok { resolved: Vec<String> },
}

pub struct ResolveHandler;

impl ResolveHandler {
    pub fn attempt_resolve(&self, input: AttemptResolveInput) -> AttemptResolveOutput {
        let mut resolved = vec![input.v1, input.v2];
        resolved.sort();
        AttemptResolveOutput::Ok { resolved }
    }
}

#[async_trait]
impl ConceptHandler for ResolveHandler {
    async fn handle(
        &self,
        invocation: ActionInvocation,
        _storage: &dyn ConceptStorage,
    ) -> TransportResult<ActionCompletion> {
        match invocation.action.as_str() {
            "attemptResolve" => {
                let input: AttemptResolveInput = input_from_fields(&invocation.input)?;
                let output = self.attempt_resolve(input);
                Ok(completion_from_output(&invocation, output)?)
            }
            other => Err(format!("Resolve has no action {other}").into()),
        }
    }
}
