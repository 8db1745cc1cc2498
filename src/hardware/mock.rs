//! Mock Hardware Implementations
//!
//! Simulated switch and instrument for `run_mode = "mock"` and for tests.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep)
//! and honour cancellation the same way the real drivers do.
//!
//! # Available Mocks
//!
//! - `MockOpticalSwitch` - routing with configurable latency and failing channels
//! - `MockFla` - scripted instrument replies, command log and overlap tracking
//!
//! Both can share an [`EventLog`] so tests can assert the order in which
//! routing and measurement happened across tasks.

use crate::error::{ControlError, ControlResult, ErrorCode};
use crate::hardware::capabilities::{FlaCommunicator, OpticalSwitch, SwitchState, SwitchStatus};
use crate::protocol::command::{center_command, gain_command, resolution_command, window_command};
use crate::protocol::frame::{decode_frame, ChecksumPolicy, FrameOptions};
use crate::protocol::trace::{expected_points, DEFAULT_RESOLUTION_M};
use crate::protocol::{AutoPeakParams, MeasurementResult, ScanTrace};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Frame the mock instrument answers when nothing is scripted.
pub const DEFAULT_MOCK_FRAME: &str =
    "OP_1.012_2.110_3.291_5.676_8.163_-79.197_-76.391_-68.657_-68.236_-73.937_9_SN9II1_405.668_PO";

/// Hardware activity recorded by the mocks.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    /// Switch began routing to a channel.
    RouteStart(u32),
    /// Switch finished routing to a channel.
    RouteEnd(u32),
    /// Instrument exchange began.
    MeasureStart(String),
    /// Instrument exchange ended.
    MeasureEnd(String),
}

/// Shared, ordered record of hardware activity.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<HardwareEvent>>>);

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, event: HardwareEvent) {
        self.0.lock().await.push(event);
    }

    /// Snapshot of all events so far.
    pub async fn events(&self) -> Vec<HardwareEvent> {
        self.0.lock().await.clone()
    }
}

/// Sleep for `latency` unless cancelled first.
async fn simulate(latency: Duration, cancel: &CancellationToken, what: &str) -> ControlResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ControlError::Cancelled(format!("{what} cancelled"))),
        _ = sleep(latency) => Ok(()),
    }
}

fn error_from_code(code: ErrorCode, message: String) -> ControlError {
    match code {
        ErrorCode::ValidationError => ControlError::Validation(message),
        ErrorCode::DeviceFault => ControlError::DeviceFault(message),
        ErrorCode::Timeout => ControlError::Timeout(message),
        ErrorCode::ProtocolFault => ControlError::ProtocolFault(message),
        ErrorCode::LinkFault => ControlError::LinkFault(message),
        ErrorCode::NotFound => ControlError::NotFound(message),
        ErrorCode::Cancelled => ControlError::Cancelled(message),
        ErrorCode::NotSupported => ControlError::NotSupported(message),
    }
}

// =============================================================================
// MockOpticalSwitch - Simulated Optical Switch
// =============================================================================

/// Mock optical switch
///
/// Simulates a 1×N switch with:
/// - 20ms routing time (configurable)
/// - Channels that always fail, to exercise routing errors
/// - Optional position readback
pub struct MockOpticalSwitch {
    input: u32,
    outputs: BTreeSet<u32>,
    latency: Duration,
    failing: HashSet<u32>,
    readback: bool,
    current: AtomicI32,
    routed: Mutex<Vec<u32>>,
    resets: AtomicUsize,
    events: Option<EventLog>,
}

impl MockOpticalSwitch {
    /// Create a switch wired to `outputs`, input 1.
    pub fn new(outputs: impl IntoIterator<Item = u32>) -> Self {
        Self {
            input: 1,
            outputs: outputs.into_iter().collect(),
            latency: Duration::from_millis(20),
            failing: HashSet::new(),
            readback: true,
            current: AtomicI32::new(-1),
            routed: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            events: None,
        }
    }

    /// Routing time per `set_channel`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make routing to `channel` fail with a device fault.
    pub fn with_failing_channel(mut self, channel: u32) -> Self {
        self.failing.insert(channel);
        self
    }

    /// Disable position readback (`query_channel` → NotSupported).
    pub fn without_readback(mut self) -> Self {
        self.readback = false;
        self
    }

    /// Record activity into `log`.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.events = Some(log);
        self
    }

    /// Channels successfully routed, in order.
    pub async fn routed(&self) -> Vec<u32> {
        self.routed.lock().await.clone()
    }

    /// Number of `reset` calls.
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    async fn record(&self, event: HardwareEvent) {
        if let Some(log) = &self.events {
            log.push(event).await;
        }
    }
}

impl Default for MockOpticalSwitch {
    fn default() -> Self {
        Self::new(1..=8)
    }
}

#[async_trait]
impl OpticalSwitch for MockOpticalSwitch {
    fn input_channel(&self) -> u32 {
        self.input
    }

    fn supported_output_channels(&self) -> &BTreeSet<u32> {
        &self.outputs
    }

    fn current_output_channel(&self) -> i32 {
        self.current.load(Ordering::SeqCst)
    }

    async fn set_channel(&self, output: u32, cancel: &CancellationToken) -> ControlResult<()> {
        if !self.supports(output) {
            return Err(ControlError::DeviceFault(format!(
                "output channel {output} is not wired"
            )));
        }

        self.record(HardwareEvent::RouteStart(output)).await;
        let outcome = simulate(self.latency, cancel, "switch routing").await;
        self.record(HardwareEvent::RouteEnd(output)).await;
        outcome?;

        if self.failing.contains(&output) {
            self.current.store(-1, Ordering::SeqCst);
            return Err(ControlError::DeviceFault(format!(
                "Err: channel {output} stuck"
            )));
        }

        self.current.store(output as i32, Ordering::SeqCst);
        self.routed.lock().await.push(output);
        tracing::debug!(output, "MockOpticalSwitch: routed");
        Ok(())
    }

    async fn query_channel(&self, _cancel: &CancellationToken) -> ControlResult<u32> {
        if !self.readback {
            return Err(ControlError::NotSupported(
                "switch has no position readback".into(),
            ));
        }
        u32::try_from(self.current_output_channel())
            .map_err(|_| ControlError::DeviceFault("switch position unknown".into()))
    }

    async fn reset(&self, _cancel: &CancellationToken) -> ControlResult<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.current.store(-1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, _cancel: &CancellationToken) -> ControlResult<SwitchStatus> {
        let state = u32::try_from(self.current_output_channel())
            .ok()
            .map(|output| SwitchState {
                input: self.input,
                output,
            });
        Ok(SwitchStatus {
            switch_index: 1,
            actual: state,
            setting: state,
            count: Some(self.routed.lock().await.len() as i64),
        })
    }
}

// =============================================================================
// MockFla - Simulated Reflectometer
// =============================================================================

/// Scripted instrument reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Raw reply text (an `OP_..._PO` frame for auto-peak).
    Frame(String),
    /// Fail the exchange with this classification.
    Fail(ErrorCode, String),
    /// Never answer; the exchange ends only by deadline or cancellation.
    Hang,
}

/// Mock FLA instrument
///
/// Each measurement exchange takes `latency` (50ms default) and consumes the
/// next scripted reply; with an empty script it answers
/// [`DEFAULT_MOCK_FRAME`] / a flat synthetic trace.
pub struct MockFla {
    latency: Duration,
    frame_options: FrameOptions,
    script: Mutex<VecDeque<MockReply>>,
    commands: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Option<EventLog>,
}

/// Decrements the in-flight counter when an exchange ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockFla {
    /// Create a mock instrument with 50ms exchanges.
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(50),
            frame_options: FrameOptions::default()
                .with_checksum(ChecksumPolicy::Verify { tolerance: 0.1 }),
            script: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events: None,
        }
    }

    /// Exchange duration.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Codec options used to decode scripted frames.
    pub fn with_frame_options(mut self, options: FrameOptions) -> Self {
        self.frame_options = options;
        self
    }

    /// Record activity into `log`.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.events = Some(log);
        self
    }

    /// Queue a reply for the next measurement exchange.
    pub async fn push_reply(&self, reply: MockReply) {
        self.script.lock().await.push_back(reply);
    }

    /// Every command received, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }

    /// Largest number of exchanges that were ever in progress at once.
    pub fn max_concurrent_exchanges(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn record(&self, event: HardwareEvent) {
        if let Some(log) = &self.events {
            log.push(event).await;
        }
    }

    /// One measurement exchange: log, overlap accounting, latency, script.
    async fn exchange(&self, command: &str, cancel: &CancellationToken) -> ControlResult<String> {
        self.commands.lock().await.push(command.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.record(HardwareEvent::MeasureStart(command.to_string()))
            .await;
        let outcome = self.answer(cancel).await;
        self.record(HardwareEvent::MeasureEnd(command.to_string()))
            .await;
        outcome
    }

    async fn answer(&self, cancel: &CancellationToken) -> ControlResult<String> {
        simulate(self.latency, cancel, "FLA exchange").await?;
        let reply = self.script.lock().await.pop_front();
        match reply {
            None => Ok(DEFAULT_MOCK_FRAME.to_string()),
            Some(MockReply::Frame(frame)) => Ok(frame),
            Some(MockReply::Fail(code, message)) => Err(error_from_code(code, message)),
            Some(MockReply::Hang) => {
                cancel.cancelled().await;
                Err(ControlError::Cancelled("FLA exchange cancelled".into()))
            }
        }
    }

    async fn configure(&self, command: String) -> ControlResult<()> {
        tracing::debug!(cmd = %command, "MockFla: configuration");
        self.commands.lock().await.push(command);
        Ok(())
    }
}

impl Default for MockFla {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlaCommunicator for MockFla {
    async fn execute_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> ControlResult<String> {
        self.exchange(command, cancel).await
    }

    async fn set_resolution(&self, mode: &str, _cancel: &CancellationToken) -> ControlResult<()> {
        self.configure(resolution_command(mode)).await
    }

    async fn set_gain(&self, ui: u32, _cancel: &CancellationToken) -> ControlResult<()> {
        self.configure(gain_command(ui)?).await
    }

    async fn set_window(&self, raw: &str, _cancel: &CancellationToken) -> ControlResult<()> {
        self.configure(window_command(raw)).await
    }

    async fn set_center(&self, raw: &str, _cancel: &CancellationToken) -> ControlResult<()> {
        self.configure(center_command(raw)).await
    }

    async fn scan(&self, window_m: f64, cancel: &CancellationToken) -> ControlResult<ScanTrace> {
        self.exchange("SCAN", cancel).await?;
        let points = expected_points(window_m, DEFAULT_RESOLUTION_M);
        let samples: Vec<f64> = (0..points).map(|i| -60.0 - (i % 50) as f64 * 0.1).collect();
        Ok(ScanTrace {
            resolution_m: DEFAULT_RESOLUTION_M,
            window_length_m: window_m,
            point_count: samples.len(),
            raw_bytes: samples.len() * crate::protocol::trace::SAMPLE_WIDTH,
            samples,
            terminated: true,
        })
    }

    async fn auto_peak(
        &self,
        params: &AutoPeakParams,
        cancel: &CancellationToken,
    ) -> ControlResult<MeasurementResult> {
        let command = params.to_command()?;
        let raw = self.exchange(&command, cancel).await?;
        Ok(decode_frame(&raw, &self.frame_options)?)
    }
}
