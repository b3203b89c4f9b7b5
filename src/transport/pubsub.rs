//! Pub/Sub transport — analogous to SQS with topics and ack deadlines.

use super::{ConceptTransport, TransportResult};
use crate::model::{ActionCompletion, ActionInvocation};
use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::Client;
use google_cloud_pubsub::subscription::Subscription;
use std::time::Duration;

pub struct PubSubTransport {
    client: Client,
    invocations_topic: String,
    completions_subscription: Subscription,
    poll_timeout: Duration,
}

impl PubSubTransport {
    pub fn new(
        client: Client,
        concept: &str,
        completions_subscription: Subscription,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client,
            invocations_topic: format!("{concept}-invocations"),
            completions_subscription,
            poll_timeout,
        }
    }

    async fn await_completion(&self, id: &str) -> TransportResult<ActionCompletion> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("timeout waiting for completion {id}").into());
            }
            let messages = self
                .completions_subscription
                .pull(10, None)
                .await?;

            for message in messages {
                let Ok(completion) =
                    serde_json::from_slice::<ActionCompletion>(&message.message.data)
                else {
                    message.ack().await?;
                    continue;
                };
                message.ack().await?;
                if completion.id == id {
                    return Ok(completion);
                }
            }
        }
    }
}

#[async_trait]
impl ConceptTransport for PubSubTransport {
    async fn invoke(&self, invocation: ActionInvocation) -> TransportResult<ActionCompletion> {
        let topic = self.client.topic(&self.invocations_topic);
        let body = serde_json::to_vec(&invocation)?;
        let publisher = topic.new_publisher(None);
        let message = PubsubMessage {
            data: body,
            ..Default::default()
        };
        publisher.publish(message).await.get().await?;
        self.await_completion(&invocation.id).await
    }
}
