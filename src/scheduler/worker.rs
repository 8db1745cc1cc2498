//! The single consumer of the task queue.

use crate::config::SchedulerConfig;
use crate::error::{ControlError, ControlResult};
use crate::hardware::bounded;
use crate::network::messages::Response;
use crate::protocol::{AutoPeakParams, FlaConfig, MeasurementData};
use crate::scheduler::bus::DeviceBus;
use crate::scheduler::store::ResultStore;
use crate::scheduler::task::{scan_window, zero_point, MeasureTask, Mode, TaskStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

pub(crate) struct Worker {
    pub(crate) bus: Arc<DeviceBus>,
    pub(crate) store: Arc<ResultStore>,
    pub(crate) config: SchedulerConfig,
}

impl Worker {
    /// Drain the queue until it closes or `shutdown` fires.
    ///
    /// On shutdown every task still queued is finished as cancelled.
    pub(crate) async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<MeasureTask>,
        shutdown: CancellationToken,
    ) {
        tracing::info!("Scheduler worker started");
        loop {
            let task = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Some(task) => task,
                    None => break,
                },
            };
            self.process(task).await;
        }

        queue.close();
        let mut abandoned = 0usize;
        while let Ok(task) = queue.try_recv() {
            let outcome = Err(ControlError::Cancelled("scheduler shut down".into()));
            if let Some(message) = self.store.finish(&task.id, outcome).await {
                notify(&task, message.into());
            }
            abandoned += 1;
        }
        tracing::info!(abandoned, "Scheduler worker stopped");
    }

    async fn process(&self, task: MeasureTask) {
        let span = info_span!(
            "task",
            task_id = %task.id,
            channel = task.channel,
            mode = %task.mode,
        );
        async {
            let outcome = if task.cancel.is_cancelled() {
                Err(ControlError::Cancelled("task cancelled before start".into()))
            } else {
                self.execute(&task).await
            };

            match &outcome {
                Ok(_) => tracing::info!("task done"),
                Err(e) => tracing::warn!(code = %e.code(), error = %e, "task failed"),
            }

            if let Some(message) = self.store.finish(&task.id, outcome).await {
                notify(&task, message.into());
            }
        }
        .instrument(span)
        .await
    }

    /// Route then measure, holding the device bus for both.
    async fn execute(&self, task: &MeasureTask) -> ControlResult<MeasurementData> {
        let cancel = &task.cancel;
        let _bus = bounded(
            "device bus wait",
            self.config.queue_wait_timeout,
            cancel,
            async { Ok::<_, ControlError>(self.bus.lock().await) },
        )
        .await?;

        self.store.advance(&task.id, TaskStatus::Routing).await;
        let routed = bounded(
            "switch routing",
            self.config.switch_timeout,
            cancel,
            self.bus.switch().set_channel(task.channel, cancel),
        )
        .await;
        if let Err(e) = routed {
            self.reset_switch().await;
            return Err(e);
        }

        self.store.advance(&task.id, TaskStatus::Scanning).await;
        bounded(
            "measurement",
            self.config.measure_timeout,
            cancel,
            measure(self.bus.as_ref(), task),
        )
        .await
    }

    /// Best effort; the task has already failed.
    async fn reset_switch(&self) {
        let cancel = CancellationToken::new();
        let reset = bounded(
            "switch reset",
            self.config.switch_timeout,
            &cancel,
            self.bus.switch().reset(&cancel),
        )
        .await;
        if let Err(e) = reset {
            tracing::warn!(error = %e, "switch reset failed");
        }
    }
}

async fn measure(bus: &DeviceBus, task: &MeasureTask) -> ControlResult<MeasurementData> {
    let fla = bus.fla();
    let cancel = &task.cancel;
    match task.mode {
        Mode::AutoPeak => {
            let params = AutoPeakParams::from_params(&task.params);
            Ok(fla.auto_peak(&params, cancel).await?.into())
        }
        Mode::Scan => {
            let settings = FlaConfig::from_params(&task.params)?;
            if !settings.is_empty() {
                fla.set_config(&settings, cancel).await?;
            }
            let window_m = scan_window(&task.params)?;
            Ok(fla.scan(window_m, cancel).await?.into())
        }
        Mode::Zero => {
            let params = AutoPeakParams::from_params(&task.params);
            Ok(fla.zero_length(&params, cancel).await?.into())
        }
        Mode::Length => {
            let zero_m = zero_point(&task.params)?;
            let params = AutoPeakParams::from_params(&task.params);
            Ok(fla.measure_length(zero_m, &params, cancel).await?.into())
        }
    }
}

/// Push a final message to the submitting session, if it is still there.
fn notify(task: &MeasureTask, response: Response) {
    if let Some(session) = task.session.upgrade() {
        if !session.send(response) {
            tracing::debug!(session = %session.id, "session closed before result push");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockFla, MockOpticalSwitch, MockReply};
    use crate::scheduler::task::TaskId;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Weak;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn task(channel: u32, mode: Mode) -> MeasureTask {
        MeasureTask {
            id: TaskId::generate(),
            session: Weak::new(),
            channel,
            mode,
            params: HashMap::new(),
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_are_logged_and_worker_drains_queue() {
        let fla = Arc::new(MockFla::new().with_latency(Duration::from_millis(1)));
        fla.push_reply(MockReply::Frame("OP_1.0_x_PO".into())).await;
        let switch = Arc::new(MockOpticalSwitch::new(1..=2).with_latency(Duration::from_millis(1)));
        let store = Arc::new(ResultStore::new());
        let worker = Worker {
            bus: Arc::new(DeviceBus::new(switch, fla)),
            store: store.clone(),
            config: SchedulerConfig::default(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let bad = task(1, Mode::AutoPeak);
        let good = task(2, Mode::Zero);
        for t in [&bad, &good] {
            store.insert(t).await;
            tx.send(t.clone()).unwrap();
        }
        drop(tx);

        worker.run(rx, CancellationToken::new()).await;

        assert_eq!(store.status(&bad.id).await.unwrap().status, TaskStatus::Failed);
        assert_eq!(store.status(&good.id).await.unwrap().status, TaskStatus::Done);
        assert!(logs_contain("task failed"));
        assert!(logs_contain("ProtocolFault"));
        assert!(logs_contain("task done"));
    }

    #[tokio::test]
    async fn pre_cancelled_task_never_touches_hardware() {
        let fla = Arc::new(MockFla::new());
        let switch = Arc::new(MockOpticalSwitch::new(1..=2));
        let store = Arc::new(ResultStore::new());
        let worker = Worker {
            bus: Arc::new(DeviceBus::new(switch.clone(), fla.clone())),
            store: store.clone(),
            config: SchedulerConfig::default(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = task(1, Mode::AutoPeak);
        cancelled.cancel.cancel();
        store.insert(&cancelled).await;
        tx.send(cancelled.clone()).unwrap();
        drop(tx);

        worker.run(rx, CancellationToken::new()).await;

        let result = store.result(&cancelled.id).await.unwrap();
        assert_eq!(
            result.error.map(|e| e.code),
            Some(crate::error::ErrorCode::Cancelled)
        );
        assert!(switch.routed().await.is_empty());
        assert!(fla.commands().await.is_empty());
    }
}
