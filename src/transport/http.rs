//! HTTP transport — synchronous POST /invoke, GET /health; failures map to
//! an `error`-variant completion.

use super::{stamp_completion, ConceptTransport, Health, TransportResult};
use crate::model::{ActionCompletion, ActionInvocation};
use async_trait::async_trait;
use std::time::Duration;

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ConceptTransport for HttpTransport {
    async fn invoke(&self, invocation: ActionInvocation) -> TransportResult<ActionCompletion> {
        let url = format!("{}/invoke", self.base_url);
        let response = self.client.post(&url).json(&invocation).send().await;

        match response {
            Ok(response) if response.status().is_success() => {
                Ok(response.json::<ActionCompletion>().await?)
            }
            Ok(response) => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "http error".to_string());
                let mut output = crate::model::Fields::new();
                output.insert("message".to_string(), serde_json::Value::String(message));
                Ok(stamp_completion(&invocation, "error", output))
            }
            Err(err) => {
                let mut output = crate::model::Fields::new();
                output.insert(
                    "message".to_string(),
                    serde_json::Value::String(err.to_string()),
                );
                Ok(stamp_completion(&invocation, "error", output))
            }
        }
    }

    async fn health(&self) -> TransportResult<Health> {
        let url = format!("{}/health", self.base_url);
        let started = std::time::Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) => Ok(Health {
                available: response.status().is_success(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            }),
            Err(_) => Ok(Health {
                available: false,
                latency_ms: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_url_is_base_plus_invoke() {
        let transport = HttpTransport::new("http://concept.local", Duration::from_secs(1));
        assert_eq!(
            format!("{}/invoke", transport.base_url),
            "http://concept.local/invoke"
        );
    }
}
