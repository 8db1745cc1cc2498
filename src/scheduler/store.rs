//! In-memory task records.
//!
//! Single map behind a `tokio::sync::RwLock`. Terminal records are written
//! once; later transitions are ignored so a cancelled task cannot be revived
//! by a late worker update.

use crate::error::{ControlError, ControlResult, ErrorInfo};
use crate::network::messages::{ResultMessage, StatusMessage};
use crate::protocol::MeasurementData;
use crate::scheduler::task::{MeasureTask, Mode, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Everything known about one task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Switch output the task routes.
    pub channel: u32,
    /// Measurement mode.
    pub mode: Mode,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Payload once `done`.
    pub data: Option<MeasurementData>,
    /// Cause once `failed`.
    pub error: Option<ErrorInfo>,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Set when the task reaches a terminal state; drives retention.
    pub finished_at: Option<DateTime<Utc>>,
    /// Cancels the task while it is queued or running.
    pub cancel: CancellationToken,
}

impl TaskRecord {
    fn status_message(&self, task_id: &TaskId) -> StatusMessage {
        StatusMessage {
            task_id: task_id.clone(),
            status: self.status,
            error: self.error.clone(),
        }
    }

    fn result_message(&self, task_id: &TaskId) -> ResultMessage {
        match (self.status, &self.data, &self.error) {
            (TaskStatus::Done, Some(data), _) => ResultMessage::done(task_id.clone(), data.clone()),
            (TaskStatus::Failed, _, Some(error)) => {
                ResultMessage::failed(task_id.clone(), error.clone())
            }
            (status, _, _) => ResultMessage::pending(task_id.clone(), status),
        }
    }
}

/// Task id → record.
#[derive(Debug, Default)]
pub struct ResultStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
}

fn not_found(task_id: &TaskId) -> ControlError {
    ControlError::NotFound(format!("no task {task_id}"))
}

impl ResultStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly admitted task as `queued`.
    pub async fn insert(&self, task: &MeasureTask) {
        let record = TaskRecord {
            channel: task.channel,
            mode: task.mode,
            status: TaskStatus::Queued,
            data: None,
            error: None,
            created_at: task.created_at,
            finished_at: None,
            cancel: task.cancel.clone(),
        };
        self.records.write().await.insert(task.id.clone(), record);
    }

    /// Drop a record that never made it onto the queue.
    pub async fn remove(&self, task_id: &TaskId) {
        self.records.write().await.remove(task_id);
    }

    /// Move a running task forward. Returns false if the task is unknown or
    /// already finished.
    pub async fn advance(&self, task_id: &TaskId, status: TaskStatus) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(task_id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Store the outcome of a task.
    ///
    /// Returns the final result message, or `None` if the task was unknown or
    /// had already finished.
    pub async fn finish(
        &self,
        task_id: &TaskId,
        outcome: ControlResult<MeasurementData>,
    ) -> Option<ResultMessage> {
        let mut records = self.records.write().await;
        let record = records.get_mut(task_id)?;
        if record.status.is_terminal() {
            return None;
        }
        match outcome {
            Ok(data) => {
                record.status = TaskStatus::Done;
                record.data = Some(data);
            }
            Err(error) => {
                record.status = TaskStatus::Failed;
                record.error = Some(error.to_info());
            }
        }
        record.finished_at = Some(Utc::now());
        Some(record.result_message(task_id))
    }

    /// Fail a task that has not left the queue yet. Returns false otherwise.
    pub async fn fail_if_queued(&self, task_id: &TaskId, error: &ControlError) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(task_id) {
            Some(record) if record.status == TaskStatus::Queued => {
                record.status = TaskStatus::Failed;
                record.error = Some(error.to_info());
                record.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Lifecycle snapshot, `NotFound` for unknown or evicted ids.
    pub async fn status(&self, task_id: &TaskId) -> ControlResult<StatusMessage> {
        self.records
            .read()
            .await
            .get(task_id)
            .map(|record| record.status_message(task_id))
            .ok_or_else(|| not_found(task_id))
    }

    /// Final or pending result, `NotFound` for unknown or evicted ids.
    pub async fn result(&self, task_id: &TaskId) -> ControlResult<ResultMessage> {
        self.records
            .read()
            .await
            .get(task_id)
            .map(|record| record.result_message(task_id))
            .ok_or_else(|| not_found(task_id))
    }

    /// Snapshot of a record.
    pub async fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.records.read().await.get(task_id).cloned()
    }

    /// Cancel token of a task that is still running.
    pub async fn cancel_token(&self, task_id: &TaskId) -> ControlResult<Option<CancellationToken>> {
        let records = self.records.read().await;
        let record = records.get(task_id).ok_or_else(|| not_found(task_id))?;
        Ok((!record.status.is_terminal()).then(|| record.cancel.clone()))
    }

    /// Remove a finished task.
    pub async fn evict(&self, task_id: &TaskId) -> ControlResult<()> {
        let mut records = self.records.write().await;
        let record = records.get(task_id).ok_or_else(|| not_found(task_id))?;
        if !record.status.is_terminal() {
            return Err(ControlError::Validation(format!(
                "task {task_id} is still {}",
                record.status
            )));
        }
        records.remove(task_id);
        Ok(())
    }

    /// Evict finished records older than `retention`. Returns how many went.
    pub async fn sweep(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| match record.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
        before - records.len()
    }

    /// Number of records held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// True when no record is held.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LengthMeasurement;
    use std::sync::Weak;

    fn task(channel: u32) -> MeasureTask {
        MeasureTask {
            id: TaskId::generate(),
            session: Weak::new(),
            channel,
            mode: Mode::Zero,
            params: HashMap::new(),
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    fn length() -> MeasurementData {
        LengthMeasurement {
            length_m: 8.163,
            amplitude_db: Some(-73.937),
            reference_m: 0.0,
        }
        .into()
    }

    #[tokio::test]
    async fn lifecycle() {
        let store = ResultStore::new();
        let task = task(1);
        store.insert(&task).await;

        let pending = store.result(&task.id).await.unwrap();
        assert_eq!(pending.status, TaskStatus::Queued);
        assert!(!pending.success);
        assert!(pending.data.is_none() && pending.error.is_none());

        assert!(store.advance(&task.id, TaskStatus::Routing).await);
        assert!(store.advance(&task.id, TaskStatus::Scanning).await);
        let done = store.finish(&task.id, Ok(length())).await.unwrap();
        assert!(done.success);
        assert_eq!(done.status, TaskStatus::Done);

        assert!(!store.advance(&task.id, TaskStatus::Routing).await);
        assert_eq!(
            store.status(&task.id).await.unwrap().status,
            TaskStatus::Done
        );
    }

    #[tokio::test]
    async fn first_outcome_wins() {
        let store = ResultStore::new();
        let task = task(2);
        store.insert(&task).await;

        let failed = store
            .finish(&task.id, Err(ControlError::Cancelled("cancel".into())))
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(store.finish(&task.id, Ok(length())).await.is_none());

        let result = store.result(&task.id).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().code,
            crate::error::ErrorCode::Cancelled
        );
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = ResultStore::new();
        let id = TaskId::from("T0-missing");
        assert!(matches!(store.status(&id).await, Err(ControlError::NotFound(_))));
        assert!(matches!(store.result(&id).await, Err(ControlError::NotFound(_))));
        assert!(matches!(store.evict(&id).await, Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn evict_only_finished() {
        let store = ResultStore::new();
        let task = task(3);
        store.insert(&task).await;

        assert!(matches!(
            store.evict(&task.id).await,
            Err(ControlError::Validation(_))
        ));
        assert!(store.cancel_token(&task.id).await.unwrap().is_some());

        store.finish(&task.id, Ok(length())).await;
        assert!(store.cancel_token(&task.id).await.unwrap().is_none());
        store.evict(&task.id).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_keeps_running_and_recent() {
        let store = ResultStore::new();
        let running = task(1);
        let finished = task(2);
        store.insert(&running).await;
        store.insert(&finished).await;
        store.finish(&finished.id, Ok(length())).await;

        assert_eq!(store.sweep(chrono::Duration::hours(1)).await, 0);
        assert_eq!(store.sweep(chrono::Duration::seconds(-1)).await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get(&running.id).await.is_some());
    }
}
