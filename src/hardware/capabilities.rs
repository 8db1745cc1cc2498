//! Hardware Capabilities
//!
//! The scheduler never talks to a concrete driver. It holds one
//! [`OpticalSwitch`] and one [`FlaCommunicator`] and programs against these
//! traits, so the real serial/TCP drivers and the mocks are interchangeable.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`ControlResult`] so failures carry their wire classification
//! - Takes a [`CancellationToken`] on every call that touches the hardware
//!
//! Neither trait queues or serializes callers. Exclusive use of the hardware
//! is the job of the scheduler's device bus.

use crate::error::{ControlError, ControlResult};
use crate::protocol::command::{MAX_END, RANGE_RESET};
use crate::protocol::{
    AutoPeakParams, FlaConfig, LengthMeasurement, MeasurementResult, ScanTrace,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

/// An input → output connection through the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchState {
    /// Input port.
    pub input: u32,
    /// Output port.
    pub output: u32,
}

/// Snapshot of the switch as reported by the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchStatus {
    /// Switch module index.
    pub switch_index: u32,
    /// Route the optics are actually in (`POS`).
    pub actual: Option<SwitchState>,
    /// Route last commanded (`SPOS?`).
    pub setting: Option<SwitchState>,
    /// Lifetime switching count (`CNT?`).
    pub count: Option<i64>,
}

/// Capability: Optical Routing
///
/// Connects the instrument (fixed input) to one of a set of output channels.
///
/// # Contract
/// - The supported output set is fixed at construction
/// - `set_channel` rejects unsupported outputs with `DeviceFault` before any I/O
/// - `current_output_channel` is the last successfully routed output, -1 if none
#[async_trait]
pub trait OpticalSwitch: Send + Sync {
    /// Fixed input port the instrument is attached to.
    fn input_channel(&self) -> u32;

    /// Outputs this switch can route to.
    fn supported_output_channels(&self) -> &BTreeSet<u32>;

    /// Last known output, or -1 if unknown.
    fn current_output_channel(&self) -> i32;

    /// True if `output` can be routed.
    fn supports(&self, output: u32) -> bool {
        self.supported_output_channels().contains(&output)
    }

    /// Route the input to `output`.
    async fn set_channel(&self, output: u32, cancel: &CancellationToken) -> ControlResult<()>;

    /// Read back the routed output from the hardware.
    async fn query_channel(&self, cancel: &CancellationToken) -> ControlResult<u32>;

    /// Best-effort return to a safe state.
    async fn reset(&self, cancel: &CancellationToken) -> ControlResult<()>;

    /// Full status readout, where the hardware has one.
    async fn status(&self, _cancel: &CancellationToken) -> ControlResult<SwitchStatus> {
        Err(ControlError::NotSupported(
            "switch status readout not available".into(),
        ))
    }
}

/// Capability: FLA Instrument Exchange
///
/// Issues commands to the reflectometer and returns decoded results. One call
/// is one exchange; implementations hold the link for its duration only.
#[async_trait]
pub trait FlaCommunicator: Send + Sync {
    /// Send one command line and return the raw reply text.
    async fn execute_command(&self, command: &str, cancel: &CancellationToken)
        -> ControlResult<String>;

    /// `SR_<mode>`
    async fn set_resolution(&self, mode: &str, cancel: &CancellationToken) -> ControlResult<()>;

    /// `G_<code>` for a UI gain of 1, 2, 5 or 10.
    async fn set_gain(&self, ui: u32, cancel: &CancellationToken) -> ControlResult<()>;

    /// `WR_<fmt5>`
    async fn set_window(&self, raw: &str, cancel: &CancellationToken) -> ControlResult<()>;

    /// `X_<fmt5>`
    async fn set_center(&self, raw: &str, cancel: &CancellationToken) -> ControlResult<()>;

    /// Apply every present setting: resolution, gain, window, center.
    async fn set_config(&self, config: &FlaConfig, cancel: &CancellationToken) -> ControlResult<()> {
        if let Some(mode) = &config.resolution {
            self.set_resolution(mode, cancel).await?;
        }
        if let Some(gain) = config.gain {
            self.set_gain(gain, cancel).await?;
        }
        if let Some(window) = &config.window {
            self.set_window(window, cancel).await?;
        }
        if let Some(center) = &config.center {
            self.set_center(center, cancel).await?;
        }
        Ok(())
    }

    /// Acquire a raw trace over a window of `window_m` metres.
    async fn scan(&self, window_m: f64, cancel: &CancellationToken) -> ControlResult<ScanTrace>;

    /// Run an auto-peak search.
    async fn auto_peak(
        &self,
        params: &AutoPeakParams,
        cancel: &CancellationToken,
    ) -> ControlResult<MeasurementResult>;

    /// Zero point of the link.
    ///
    /// Resets the measurement range (`X_00000`, `WR_00000`), runs an
    /// auto-peak search and takes the third peak, or the farthest one when
    /// fewer than three were found.
    async fn zero_length(
        &self,
        params: &AutoPeakParams,
        cancel: &CancellationToken,
    ) -> ControlResult<LengthMeasurement> {
        self.set_center(RANGE_RESET, cancel).await?;
        self.set_window(RANGE_RESET, cancel).await?;
        let result = self.auto_peak(params, cancel).await?;
        LengthMeasurement::zero_point(&result)
            .ok_or_else(|| ControlError::DeviceFault("auto-peak found no peaks".into()))
    }

    /// Product length: farthest peak past `zero_m`, searched out to the maximum range.
    async fn measure_length(
        &self,
        zero_m: f64,
        params: &AutoPeakParams,
        cancel: &CancellationToken,
    ) -> ControlResult<LengthMeasurement> {
        let search = params
            .clone()
            .with_start(format!("{zero_m:.3}"))
            .with_end(MAX_END);
        let result = self.auto_peak(&search, cancel).await?;
        LengthMeasurement::from_farthest_peak(&result, zero_m)
            .ok_or_else(|| ControlError::DeviceFault("auto-peak found no peaks".into()))
    }
}
