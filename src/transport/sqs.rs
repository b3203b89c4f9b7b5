//! SQS transport — invocations to `<concept>-invocations`, completions read
//! from `<concept>-completions`; correlation by `id`; a request fails if no
//! completion appears within the configured timeout.

use super::{ConceptTransport, TransportResult};
use crate::model::{ActionCompletion, ActionInvocation};
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use std::time::Duration;

pub struct SqsTransport {
    client: Client,
    invocations_queue_url: String,
    completions_queue_url: String,
    poll_timeout: Duration,
}

impl SqsTransport {
    pub fn new(
        client: Client,
        prefix: &str,
        concept: &str,
        queue_url_for: impl Fn(&str) -> String,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client,
            invocations_queue_url: queue_url_for(&format!("{prefix}{concept}-invocations")),
            completions_queue_url: queue_url_for(&format!("{prefix}{concept}-completions")),
            poll_timeout,
        }
    }

    /// Builds a client from the standard AWS environment/credential chain
    /// (region, profile, env vars) and resolves queue URLs by name via
    /// `get_queue_url`, rather than requiring the caller to already know
    /// them.
    pub async fn connect(prefix: &str, concept: &str, poll_timeout: Duration) -> TransportResult<Self> {
        let sdk_config = aws_config::load_from_env().await;
        let client = Client::new(&sdk_config);

        let invocations_name = format!("{prefix}{concept}-invocations");
        let completions_name = format!("{prefix}{concept}-completions");
        let invocations_queue_url = client
            .get_queue_url()
            .queue_name(&invocations_name)
            .send()
            .await?
            .queue_url()
            .ok_or_else(|| format!("queue {invocations_name} has no url"))?
            .to_string();
        let completions_queue_url = client
            .get_queue_url()
            .queue_name(&completions_name)
            .send()
            .await?
            .queue_url()
            .ok_or_else(|| format!("queue {completions_name} has no url"))?
            .to_string();

        Ok(Self {
            client,
            invocations_queue_url,
            completions_queue_url,
            poll_timeout,
        })
    }

    async fn await_completion(&self, id: &str) -> TransportResult<ActionCompletion> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("timeout waiting for completion {id}").into());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let wait_seconds = remaining.as_secs().clamp(1, 20) as i32;

            let received = self
                .client
                .receive_message()
                .queue_url(&self.completions_queue_url)
                .wait_time_seconds(wait_seconds)
                .max_number_of_messages(10)
                .send()
                .await?;

            for message in received.messages() {
                let Some(body) = message.body() else { continue };
                let Ok(completion) = serde_json::from_str::<ActionCompletion>(body) else {
                    continue;
                };
                if let Some(receipt) = message.receipt_handle() {
                    let _ = self
                        .client
                        .delete_message()
                        .queue_url(&self.completions_queue_url)
                        .receipt_handle(receipt)
                        .send()
                        .await;
                }
                if completion.id == id {
                    return Ok(completion);
                }
            }
        }
    }
}

#[async_trait]
impl ConceptTransport for SqsTransport {
    async fn invoke(&self, invocation: ActionInvocation) -> TransportResult<ActionCompletion> {
        let body = serde_json::to_string(&invocation)?;
        self.client
            .send_message()
            .queue_url(&self.invocations_queue_url)
            .message_body(body)
            .send()
            .await?;
        self.await_completion(&invocation.id).await
    }
}
