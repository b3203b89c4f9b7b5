// PessimisticLock Concept Implementation (Rust)
//
// checkOut/checkIn over a single resource slot plus a FIFO wait queue.
// Claim/release bookkeeping reworked around a resource lock instead of a
// work item.

use crate::demo::support::{completion_from_output, input_from_fields};
use crate::model::{ActionCompletion, ActionInvocation};
use crate::storage::{ConceptStorage, StorageResult};
use crate::transport::in_process::ConceptHandler;
use crate::transport::TransportResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckOutInput {
    pub resource: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "variant")]
pub enum CheckOutOutput {
    #[serde(rename = "ok")]
    Ok { lock_id: String },
    #[serde(rename = "queued")]
    Queued { position: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckInInput {
    pub lock_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "variant")]
pub enum CheckInOutput {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "notfound")]
    NotFound,
}

pub struct LockHandler;

impl LockHandler {
    pub async fn check_out(&self, input: CheckOutInput, storage: &dyn ConceptStorage) -> StorageResult<CheckOutOutput> {
        let CheckOutInput { resource, user } = input;

        if let Some(lock) = storage.get("lock", &resource).await? {
            let holder = lock["holder"].as_str().unwrap_or_default();
            if holder == user {
                let lock_id = lock["lock_id"].as_str().unwrap_or_default().to_string();
                return Ok(CheckOutOutput::Ok { lock_id });
            }
            let mut waiting = self.waiting_for(&resource, storage).await?;
            if !waiting.iter().any(|u| u == &user) {
                waiting.push(user.clone());
                self.put_waiting(&resource, &waiting, storage).await?;
            }
            let position = waiting.iter().position(|u| u == &user).unwrap() + 1;
            return Ok(CheckOutOutput::Queued { position });
        }

        let mut waiting = self.waiting_for(&resource, storage).await?;
        if waiting.is_empty() || waiting[0] == user {
            if !waiting.is_empty() {
                waiting.remove(0);
                self.put_waiting(&resource, &waiting, storage).await?;
            }
            let lock_id = uuid::Uuid::new_v4().to_string();
            storage
                .put(
                    "lock",
                    &resource,
                    json!({ "resource": resource, "holder": user, "lock_id": lock_id }),
                )
                .await?;
            return Ok(CheckOutOutput::Ok { lock_id });
        }

        if !waiting.iter().any(|u| u == &user) {
            waiting.push(user.clone());
            self.put_waiting(&resource, &waiting, storage).await?;
        }
        let position = waiting.iter().position(|u| u == &user).unwrap() + 1;
        Ok(CheckOutOutput::Queued { position })
    }

    pub async fn check_in(&self, input: CheckInInput, storage: &dyn ConceptStorage) -> StorageResult<CheckInOutput> {
        let found = storage
            .find("lock", Some(&json!({ "lock_id": input.lock_id })))
            .await?;
        let Some(lock) = found.into_iter().next() else {
            return Ok(CheckInOutput::NotFound);
        };
        let resource = lock["resource"].as_str().unwrap_or_default().to_string();
        storage.del("lock", &resource).await?;
        Ok(CheckInOutput::Ok)
    }

    pub async fn queue_len(&self, resource: &str, storage: &dyn ConceptStorage) -> StorageResult<usize> {
        Ok(self.waiting_for(resource, storage).await?.len())
    }

    async fn waiting_for(&self, resource: &str, storage: &dyn ConceptStorage) -> StorageResult<Vec<String>> {
        let row = storage.get("queue", resource).await?;
        Ok(row
            .and_then(|v| v.get("waiting").cloned())
            .and_then(|v| v.as_array().cloned())
            .map(|arr| arr.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    async fn put_waiting(&self, resource: &str, waiting: &[String], storage: &dyn ConceptStorage) -> StorageResult<()> {
        storage
            .put("queue", resource, json!({ "resource": resource, "waiting": waiting }))
            .await
    }
}

#[async_trait]
impl ConceptHandler for LockHandler {
    async fn handle(
        &self,
        invocation: ActionInvocation,
        storage: &dyn ConceptStorage,
    ) -> TransportResult<ActionCompletion> {
        match invocation.action.as_str() {
            "checkOut" => {
                let input: CheckOutInput = input_from_fields(&invocation.input)?;
                let output = self.check_out(input, storage).await?;
                Ok(completion_from_output(&invocation, output)?)
            }
            "checkIn" => {
                let input: CheckInInput = input_from_fields(&invocation.input)?;
                let output = self.check_in(input, storage).await?;
                Ok(completion_from_output(&invocation, output)?)
            }
            other => Err(format!("PessimisticLock has no action {other}").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn pessimistic_lock_scenario() {
        let storage = InMemoryStorage::new();
        let handler = LockHandler;

        let CheckOutOutput::Ok { lock_id: l1 } = handler
            .check_out(
                CheckOutInput {
                    resource: "r".into(),
                    user: "alice".into(),
                },
                &storage,
            )
            .await
            .unwrap()
        else {
            panic!("expected ok");
        };

        let reentrant = handler
            .check_out(
                CheckOutInput {
                    resource: "r".into(),
                    user: "alice".into(),
                },
                &storage,
            )
            .await
            .unwrap();
        assert!(matches!(reentrant, CheckOutOutput::Ok { ref lock_id } if *lock_id == l1));

        let bob_first = handler
            .check_out(
                CheckOutInput {
                    resource: "r".into(),
                    user: "bob".into(),
                },
                &storage,
            )
            .await
            .unwrap();
        assert!(matches!(bob_first, CheckOutOutput::Queued { position: 1 }));

        let checked_in = handler
            .check_in(CheckInInput { lock_id: l1 }, &storage)
            .await
            .unwrap();
        assert!(matches!(checked_in, CheckInOutput::Ok));

        let bob_second = handler
            .check_out(
                CheckOutInput {
                    resource: "r".into(),
                    user: "bob".into(),
                },
                &storage,
            )
            .await
            .unwrap();
        assert!(matches!(bob_second, CheckOutOutput::Ok { .. }));
        assert_eq!(handler.queue_len("r", &storage).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn check_in_unknown_lock_is_notfound() {
        let storage = InMemoryStorage::new();
        let handler = LockHandler;
        let out = handler
            .check_in(CheckInInput { lock_id: "bogus".into() }, &storage)
            .await
            .unwrap();
        assert!(matches!(out, CheckInOutput::NotFound));
    }
}
