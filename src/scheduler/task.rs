//! Measurement tasks and their lifecycle.

use crate::error::{ControlError, ControlResult};
use crate::network::session::ClientSession;
use crate::protocol::frame::is_decimal_token;
use crate::protocol::trace::MAX_WINDOW_M;
use crate::protocol::{AutoPeakParams, FlaConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Weak;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Scan window used when a `scan` task gives no `window_m`.
pub const DEFAULT_SCAN_WINDOW_M: f64 = 30.0;

/// Unique task identifier: `T<yyyyMMddHHmmssfff>-<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Fresh id from the current UTC time and a random suffix.
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("T{stamp}-{}", &uuid[..8]))
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

/// What the instrument does once the channel is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Apply acquisition settings, then acquire a raw trace.
    Scan,
    /// Auto-peak search.
    AutoPeak,
    /// Zero point of the link (third peak, or the farthest).
    Zero,
    /// Product length past a known zero point.
    Length,
}

impl Mode {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Scan => "scan",
            Mode::AutoPeak => "autopeak",
            Mode::Zero => "zero",
            Mode::Length => "length",
        }
    }

    /// Check `params` for this mode without touching the hardware.
    pub fn validate_params(&self, params: &HashMap<String, String>) -> ControlResult<()> {
        match self {
            Mode::Scan => {
                FlaConfig::from_params(params)?;
                scan_window(params)?;
                Ok(())
            }
            Mode::AutoPeak | Mode::Zero => AutoPeakParams::from_params(params).validate(),
            Mode::Length => {
                zero_point(params)?;
                AutoPeakParams::from_params(params).validate()
            }
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scan" => Ok(Mode::Scan),
            "autopeak" | "auto_peak" | "auto-peak" => Ok(Mode::AutoPeak),
            "zero" => Ok(Mode::Zero),
            "length" => Ok(Mode::Length),
            other => Err(ControlError::Validation(format!("unknown mode '{other}'"))),
        }
    }
}

/// `window_m` of a scan task, or the default window. At most `MAX_WINDOW_M`.
pub fn scan_window(params: &HashMap<String, String>) -> ControlResult<f64> {
    let Some(raw) = params.get("window_m").map(|v| v.trim()) else {
        return Ok(DEFAULT_SCAN_WINDOW_M);
    };
    let window: f64 = raw
        .parse()
        .ok()
        .filter(|_| is_decimal_token(raw))
        .ok_or_else(|| ControlError::Validation(format!("window_m must be a number (got '{raw}')")))?;
    if window <= 0.0 {
        return Err(ControlError::Validation(format!(
            "window_m must be positive (got {window})"
        )));
    }
    if window > MAX_WINDOW_M {
        return Err(ControlError::Validation(format!(
            "window_m must not exceed {MAX_WINDOW_M} (got {raw})"
        )));
    }
    Ok(window)
}

/// Required `zero_m` of a length task.
pub fn zero_point(params: &HashMap<String, String>) -> ControlResult<f64> {
    let raw = params
        .get("zero_m")
        .map(|v| v.trim())
        .ok_or_else(|| ControlError::Validation("length mode requires 'zero_m'".into()))?;
    raw.parse()
        .ok()
        .filter(|v: &f64| v.is_finite() && is_decimal_token(raw))
        .ok_or_else(|| ControlError::Validation(format!("zero_m must be a number (got '{raw}')")))
}

/// Lifecycle: `queued → routing → scanning → done | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for the worker.
    Queued,
    /// Holding the device bus, switching the channel.
    Routing,
    /// Measuring.
    Scanning,
    /// Finished with data.
    Done,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// `done` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Routing => "routing",
            TaskStatus::Scanning => "scanning",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One admitted unit of work. Immutable once queued.
#[derive(Debug, Clone)]
pub struct MeasureTask {
    /// Task id handed back in the ack.
    pub id: TaskId,
    /// Submitting session, if it is still connected when the task ends.
    pub session: Weak<ClientSession>,
    /// Switch output to route.
    pub channel: u32,
    /// Measurement mode.
    pub mode: Mode,
    /// Validated mode parameters.
    pub params: HashMap<String, String>,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Child of the scheduler's shutdown token.
    pub cancel: CancellationToken,
}
