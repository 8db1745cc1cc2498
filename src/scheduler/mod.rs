//! Measurement Task Scheduler
//!
//! Admits tasks from client sessions, queues them FIFO and runs them one at a
//! time against the shared [`DeviceBus`]:
//!
//! ```text
//! submit ──► store(queued) ──► mpsc queue ──► worker
//!                                              │ lock bus
//!                                              │ routing:  switch.set_channel
//!                                              │ scanning: fla.<mode>
//!                                              ▼
//!                                  store(done | failed) ──► session push
//! ```
//!
//! Status and results are served from the store by task id until the
//! retention sweeper (or an explicit [`Scheduler::evict`]) removes them.

pub mod bus;
pub mod store;
pub mod task;
mod worker;

pub use bus::DeviceBus;
pub use store::{ResultStore, TaskRecord};
pub use task::{MeasureTask, Mode, TaskId, TaskStatus};

use crate::config::SchedulerConfig;
use crate::error::{ControlError, ControlResult};
use crate::hardware::{bounded, SwitchStatus};
use crate::network::messages::{AckMessage, ResultMessage, StatusMessage, SubmitRequest};
use crate::network::session::ClientSession;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use worker::Worker;

/// Handle to the running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    bus: Arc<DeviceBus>,
    store: Arc<ResultStore>,
    queue: mpsc::UnboundedSender<MeasureTask>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker and the retention sweeper. Must be called inside a
    /// Tokio runtime.
    pub fn start(bus: DeviceBus, config: SchedulerConfig) -> Self {
        let bus = Arc::new(bus);
        let store = Arc::new(ResultStore::new());
        let shutdown = CancellationToken::new();
        let (queue, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            bus: bus.clone(),
            store: store.clone(),
            config: config.clone(),
        };
        let worker = tokio::spawn(worker.run(rx, shutdown.clone()));
        let sweeper = tokio::spawn(sweep(
            store.clone(),
            config.retention,
            config.sweep_interval,
            shutdown.clone(),
        ));

        tracing::info!(channels = ?bus.supported_channels(), "Scheduler started");

        Self {
            inner: Arc::new(Inner {
                bus,
                store,
                queue,
                config,
                shutdown,
                handles: Mutex::new(vec![worker, sweeper]),
            }),
        }
    }

    /// Validate and queue a task. Returns as soon as it is queued.
    ///
    /// Invalid channel, mode or params are rejected with `Validation` and
    /// leave no trace in the store.
    #[instrument(skip(self, request, session), fields(channel = request.channel, mode = %request.mode), err)]
    pub async fn submit(
        &self,
        request: SubmitRequest,
        session: Option<&Arc<ClientSession>>,
    ) -> ControlResult<AckMessage> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ControlError::Cancelled("scheduler is shutting down".into()));
        }

        let channels = self.inner.bus.supported_channels();
        if !channels.contains(&request.channel) {
            return Err(ControlError::Validation(format!(
                "channel {} is not a supported output {:?}",
                request.channel, channels
            )));
        }
        let mode: Mode = request.mode.parse()?;
        mode.validate_params(&request.params)?;

        let task = MeasureTask {
            id: TaskId::generate(),
            session: session.map(Arc::downgrade).unwrap_or_default(),
            channel: request.channel,
            mode,
            params: request.params,
            created_at: Utc::now(),
            cancel: self.inner.shutdown.child_token(),
        };
        let ack = AckMessage {
            task_id: task.id.clone(),
            channel: task.channel,
            mode,
        };

        self.inner.store.insert(&task).await;
        if self.inner.queue.send(task).is_err() {
            self.inner.store.remove(&ack.task_id).await;
            return Err(ControlError::Cancelled("scheduler is not running".into()));
        }

        tracing::info!(task_id = %ack.task_id, "task queued");
        Ok(ack)
    }

    /// Lifecycle snapshot of a task.
    pub async fn status(&self, task_id: &TaskId) -> ControlResult<StatusMessage> {
        self.inner.store.status(task_id).await
    }

    /// Final result, or a pending message while the task is still running.
    pub async fn result(&self, task_id: &TaskId) -> ControlResult<ResultMessage> {
        self.inner.store.result(task_id).await
    }

    /// Cancel a queued or running task. Finished tasks are left alone.
    ///
    /// A queued task is failed at once; a running one fails as soon as its
    /// current device exchange is aborted, so the returned status may still
    /// show `routing` or `scanning`.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: &TaskId) -> ControlResult<StatusMessage> {
        if let Some(token) = self.inner.store.cancel_token(task_id).await? {
            token.cancel();
            let error = ControlError::Cancelled("task cancelled by client".into());
            if self.inner.store.fail_if_queued(task_id, &error).await {
                tracing::info!("queued task cancelled");
            } else {
                tracing::info!("running task cancelled");
            }
        }
        self.inner.store.status(task_id).await
    }

    /// Drop a finished task from the store.
    pub async fn evict(&self, task_id: &TaskId) -> ControlResult<()> {
        self.inner.store.evict(task_id).await
    }

    /// Read the switch status between tasks.
    pub async fn switch_status(&self) -> ControlResult<SwitchStatus> {
        let cancel = self.inner.shutdown.child_token();
        let _bus = bounded(
            "device bus wait",
            self.inner.config.queue_wait_timeout,
            &cancel,
            async { Ok::<_, ControlError>(self.inner.bus.lock().await) },
        )
        .await?;
        bounded(
            "switch status",
            self.inner.config.switch_timeout,
            &cancel,
            self.inner.bus.switch().status(&cancel),
        )
        .await
    }

    /// Outputs tasks may be submitted for.
    pub fn supported_channels(&self) -> &BTreeSet<u32> {
        self.inner.bus.supported_channels()
    }

    /// Task records.
    pub fn store(&self) -> &ResultStore {
        &self.inner.store
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Abort the running exchange, fail queued tasks as cancelled and wait
    /// for the worker and sweeper to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *self.inner.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler task panicked");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("bus", &self.inner.bus)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

async fn sweep(
    store: Arc<ResultStore>,
    retention: Duration,
    every: Duration,
    shutdown: CancellationToken,
) {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = store.sweep(retention).await;
                if evicted > 0 {
                    tracing::debug!(evicted, "expired task records swept");
                }
            }
        }
    }
}
