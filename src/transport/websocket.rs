//! WebSocket transport — JSON frames `{ type, id, payload }`, correlated by
//! `id`; closing the socket marks the URI unavailable.

use super::{ConceptTransport, Health, PushCompletionHandler, TransportResult};
use crate::model::{ActionCompletion, ActionInvocation};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameType {
    Invoke,
    Query,
    Health,
    Completion,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    frame_type: FrameType,
    id: String,
    payload: Value,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>;

/// A duplex WebSocket connection to one concept's endpoint. The write half
/// is shared; the read loop dispatches responses by `id` to whichever
/// `invoke`/`query`/`health` call is waiting, and routes unsolicited
/// `completion` frames to the push handler.
pub struct WebSocketTransport {
    write: Mutex<futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >>,
    pending: Pending,
    available: Arc<AtomicBool>,
    push_handler: Arc<std::sync::Mutex<Option<PushCompletionHandler>>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let (stream, _) = connect_async(url).await?;
        let (write, mut read) = stream.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let available = Arc::new(AtomicBool::new(true));
        let push_handler: Arc<std::sync::Mutex<Option<PushCompletionHandler>>> =
            Arc::new(std::sync::Mutex::new(None));

        let transport = Self {
            write: Mutex::new(write),
            pending: pending.clone(),
            available: available.clone(),
            push_handler: push_handler.clone(),
        };

        let pending_task = pending.clone();
        let available_task = available.clone();
        let push_handler_task = push_handler.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                            if matches!(frame.frame_type, FrameType::Completion) {
                                let has_waiter = pending_task.lock().await.contains_key(&frame.id);
                                if !has_waiter {
                                    if let Ok(completion) =
                                        serde_json::from_value::<ActionCompletion>(frame.payload.clone())
                                    {
                                        if let Some(handler) = push_handler_task.lock().unwrap().as_ref() {
                                            handler(completion);
                                        }
                                    }
                                    continue;
                                }
                            }
                            let mut guard = pending_task.lock().await;
                            if let Some(tx) = guard.remove(&frame.id) {
                                let _ = tx.send(frame);
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => {
                        available_task.store(false, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }
            }
            available_task.store(false, Ordering::SeqCst);
        });

        Ok(transport)
    }

    async fn roundtrip(&self, frame_type: FrameType, payload: Value) -> TransportResult<Frame> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let frame = Frame {
            frame_type,
            id: id.clone(),
            payload,
        };
        self.write
            .lock()
            .await
            .send(Message::Text(serde_json::to_string(&frame)?))
            .await?;

        rx.await
            .map_err(|_| "websocket connection closed before response".into())
    }
}

#[async_trait]
impl ConceptTransport for WebSocketTransport {
    async fn invoke(&self, invocation: ActionInvocation) -> TransportResult<ActionCompletion> {
        let response = self
            .roundtrip(FrameType::Invoke, serde_json::to_value(&invocation)?)
            .await?;
        match response.frame_type {
            FrameType::Error => Err(response.payload.to_string().into()),
            _ => Ok(serde_json::from_value(response.payload)?),
        }
    }

    async fn query(&self, request: super::ConceptQuery) -> TransportResult<Vec<Value>> {
        let response = self
            .roundtrip(
                FrameType::Query,
                serde_json::json!({ "relation": request.relation, "args": request.args }),
            )
            .await?;
        Ok(response
            .payload
            .as_array()
            .cloned()
            .unwrap_or_default())
    }

    async fn health(&self) -> TransportResult<Health> {
        if !self.available.load(Ordering::SeqCst) {
            return Ok(Health {
                available: false,
                latency_ms: None,
            });
        }
        let started = std::time::Instant::now();
        let response = self.roundtrip(FrameType::Health, Value::Null).await?;
        let available = response
            .payload
            .get("available")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        Ok(Health {
            available,
            latency_ms: Some(started.elapsed().as_millis() as u64),
        })
    }

    fn on_push_completion(&self, handler: PushCompletionHandler) {
        *self.push_handler.lock().unwrap() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame {
            frame_type: FrameType::Invoke,
            id: "abc".into(),
            payload: serde_json::json!({"k": "v"}),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "abc");
        assert!(matches!(back.frame_type, FrameType::Invoke));
    }
}
