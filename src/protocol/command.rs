//! Outbound instrument commands.
//!
//! Protocol overview (TCP, ASCII, `\n` terminated):
//! - On connect the instrument sends `OCI`; `QUIT` closes the session.
//! - `SR_<mode>` resolution, `G_<code>` gain, `WR_<5 chars>` window length,
//!   `X_<5 chars>` window center. Each is acknowledged with a line containing `OK`.
//! - `SCAN` returns a raw trace (see [`crate::protocol::trace`]).
//! - `SCAN_<start>_<end>_<count>_<algo>_<width>_<thr>_<id>_<sn>_<sum>_NACS`
//!   runs the auto-peak search and is answered with an `OP_..._PO` frame.

use crate::error::{ControlError, ControlResult};
use crate::protocol::frame::{is_decimal_token, is_serial_token, serial_digit_sum};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sent by the instrument once a connection is accepted.
pub const HANDSHAKE: &str = "OCI";
/// Substring of every positive configuration acknowledgement.
pub const ACK: &str = "OK";
/// Raw trace acquisition.
pub const SCAN: &str = "SCAN";
/// Graceful disconnect.
pub const QUIT: &str = "QUIT";
/// Line terminator for outbound commands.
pub const TERMINATOR: &str = "\n";
/// Trailer of the auto-peak command.
pub const AUTO_PEAK_TRAILER: &str = "NACS";

/// Auto-peak search window end used when measuring a product past the zero point.
pub const MAX_END: &str = "300.0";

/// `WR_`/`X_` argument that resets the measurement range before zeroing.
pub const RANGE_RESET: &str = "00000";

/// Parameters of one auto-peak command.
///
/// Values are kept as strings because the instrument echoes them into its
/// checksum exactly as sent (`"09"` and `"9"` are both legal ids).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoPeakParams {
    /// Search window start, metres.
    pub start: String,
    /// Search window end, metres.
    pub end: String,
    /// Requested peak count.
    pub count: String,
    /// Peak-search algorithm selector.
    pub algo: String,
    /// Peak width, metres.
    pub width: String,
    /// Detection threshold, dB.
    pub threshold: String,
    /// Channel id echoed by the instrument.
    pub id: String,
    /// Device serial-number token.
    pub sn: String,
}

impl Default for AutoPeakParams {
    fn default() -> Self {
        Self {
            start: "0.0".into(),
            end: "30.0".into(),
            count: "2".into(),
            algo: "2".into(),
            width: "0.5".into(),
            threshold: "-80".into(),
            id: "12".into(),
            sn: "SN9II1".into(),
        }
    }
}

impl AutoPeakParams {
    /// Overlay task parameters on the defaults.
    ///
    /// Recognised keys: `start`, `end`, `count`, `algo`, `width`,
    /// `threshold` (or `thr`), `id`, `sn`. Unknown keys are ignored.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let mut out = Self::default();
        for (key, value) in params {
            let value = value.trim().to_string();
            match key.as_str() {
                "start" => out.start = value,
                "end" => out.end = value,
                "count" => out.count = value,
                "algo" => out.algo = value,
                "width" => out.width = value,
                "threshold" | "thr" => out.threshold = value,
                "id" => out.id = value,
                "sn" => out.sn = value,
                _ => {}
            }
        }
        out
    }

    /// Same parameters with a different search start.
    pub fn with_start(mut self, start: impl Into<String>) -> Self {
        self.start = start.into();
        self
    }

    /// Same parameters with a different search end.
    pub fn with_end(mut self, end: impl Into<String>) -> Self {
        self.end = end.into();
        self
    }

    fn numeric_fields(&self) -> [(&'static str, &str); 7] {
        [
            ("start", &self.start),
            ("end", &self.end),
            ("count", &self.count),
            ("algo", &self.algo),
            ("width", &self.width),
            ("threshold", &self.threshold),
            ("id", &self.id),
        ]
    }

    /// Every numeric field must be a decimal and `sn` a serial token.
    pub fn validate(&self) -> ControlResult<()> {
        for (name, value) in self.numeric_fields() {
            if !is_decimal_token(value) {
                return Err(ControlError::Validation(format!(
                    "auto-peak parameter '{name}' is not a number: '{value}'"
                )));
            }
        }
        if !is_serial_token(&self.sn) {
            return Err(ControlError::Validation(format!(
                "auto-peak parameter 'sn' is not a serial token: '{}'",
                self.sn
            )));
        }
        Ok(())
    }

    /// Σ|numeric fields| + Σ serial digits.
    pub fn checksum(&self) -> ControlResult<f64> {
        self.validate()?;
        let mut sum = 0.0;
        for (name, value) in self.numeric_fields() {
            let parsed: f64 = value.parse().map_err(|_| {
                ControlError::Validation(format!("auto-peak parameter '{name}' is not a number"))
            })?;
            sum += parsed.abs();
        }
        Ok(sum + f64::from(serial_digit_sum(&self.sn)))
    }

    /// Render the auto-peak command line (without terminator).
    pub fn to_command(&self) -> ControlResult<String> {
        let sum = self.checksum()?;
        Ok(format!(
            "{SCAN}_{}_{}_{}_{}_{}_{}_{}_{}_{:.3}_{AUTO_PEAK_TRAILER}",
            self.start,
            self.end,
            self.count,
            self.algo,
            self.width,
            self.threshold,
            self.id,
            self.sn,
            sum
        ))
    }
}

/// Acquisition settings applied before a raw scan. Unset fields are left as
/// the instrument has them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaConfig {
    /// Resolution mode for `SR_`.
    pub resolution: Option<String>,
    /// UI gain factor (1, 2, 5 or 10).
    pub gain: Option<u32>,
    /// Window length for `WR_`.
    pub window: Option<String>,
    /// Window center for `X_`.
    pub center: Option<String>,
}

impl FlaConfig {
    /// Read settings from task parameters.
    ///
    /// Keys: `resolution` (or `sr_mode`), `gain`, `window` (or `wr_len`),
    /// `center` (or `x_center`).
    pub fn from_params(params: &HashMap<String, String>) -> ControlResult<Self> {
        let lookup = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| params.get(*k))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let gain = match lookup(&["gain"]) {
            Some(raw) => {
                let ui: u32 = raw.parse().map_err(|_| {
                    ControlError::Validation(format!("gain must be an integer (got '{raw}')"))
                })?;
                gain_code(ui)?;
                Some(ui)
            }
            None => None,
        };

        let window = lookup(&["window", "wr_len"]);
        let center = lookup(&["center", "x_center"]);
        for (name, value) in [("window", &window), ("center", &center)] {
            if let Some(value) = value {
                if !is_decimal_token(value) {
                    return Err(ControlError::Validation(format!(
                        "{name} must be a number (got '{value}')"
                    )));
                }
            }
        }

        Ok(Self {
            resolution: lookup(&["resolution", "sr_mode"]),
            gain,
            window,
            center,
        })
    }

    /// True if no setting is present.
    pub fn is_empty(&self) -> bool {
        self.resolution.is_none()
            && self.gain.is_none()
            && self.window.is_none()
            && self.center.is_none()
    }
}

/// Fixed-width argument: trimmed, truncated to 5 chars, left-padded with `0`.
pub fn fmt5(raw: &str) -> String {
    let truncated: String = raw.trim().chars().take(5).collect();
    format!("{truncated:0>5}")
}

/// Map a UI gain factor to the instrument's gain code.
pub fn gain_code(ui: u32) -> ControlResult<u8> {
    match ui {
        1 => Ok(1),
        2 => Ok(2),
        5 => Ok(3),
        10 => Ok(4),
        other => Err(ControlError::Validation(format!(
            "gain must be one of 1, 2, 5, 10 (got {other})"
        ))),
    }
}

/// `SR_<mode>`
pub fn resolution_command(mode: &str) -> String {
    format!("SR_{}", mode.trim())
}

/// `G_<code>`
pub fn gain_command(ui: u32) -> ControlResult<String> {
    Ok(format!("G_{}", gain_code(ui)?))
}

/// `WR_<fmt5>`
pub fn window_command(raw: &str) -> String {
    format!("WR_{}", fmt5(raw))
}

/// `X_<fmt5>`
pub fn center_command(raw: &str) -> String {
    format!("X_{}", fmt5(raw))
}

/// True if a configuration reply acknowledges the command.
pub fn is_ack(reply: &str) -> bool {
    reply.contains(ACK)
}

/// True if a reply reports a device-side error.
pub fn is_error_reply(reply: &str) -> bool {
    reply.trim_start().to_ascii_uppercase().starts_with("ERR")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_auto_peak_command() {
        let cmd = AutoPeakParams::default().to_command().unwrap();
        assert_eq!(cmd, "SCAN_0.0_30.0_2_2_0.5_-80_12_SN9II1_136.500_NACS");
    }

    #[test]
    fn auto_peak_command_keeps_tokens_verbatim() {
        let params = AutoPeakParams {
            start: "0.5".into(),
            end: "25".into(),
            count: "2".into(),
            algo: "2".into(),
            width: "0.513".into(),
            threshold: "-80".into(),
            id: "09".into(),
            sn: "SN9II1".into(),
        };
        assert_eq!(
            params.to_command().unwrap(),
            "SCAN_0.5_25_2_2_0.513_-80_09_SN9II1_129.013_NACS"
        );
    }

    #[test]
    fn from_params_overlays_defaults() {
        let params: HashMap<String, String> = [
            ("start".to_string(), " 5.0 ".to_string()),
            ("thr".to_string(), "-70".to_string()),
            ("unrelated".to_string(), "x".to_string()),
        ]
        .into_iter()
        .collect();

        let parsed = AutoPeakParams::from_params(&params);
        assert_eq!(parsed.start, "5.0");
        assert_eq!(parsed.threshold, "-70");
        assert_eq!(parsed.end, "30.0");
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_numeric_fields() {
        let params = AutoPeakParams::default().with_end("far");
        let err = params.validate().unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        assert!(err.to_string().contains("end"));

        let bad_sn = AutoPeakParams {
            sn: "123".into(),
            ..Default::default()
        };
        assert!(bad_sn.to_command().is_err());
    }

    #[test]
    fn fmt5_pads_and_truncates() {
        assert_eq!(fmt5("6.0"), "006.0");
        assert_eq!(fmt5(" 1.00 "), "01.00");
        assert_eq!(fmt5("123.456"), "123.4");
        assert_eq!(fmt5(""), "00000");
    }

    #[test]
    fn gain_codes() {
        assert_eq!(gain_code(1).unwrap(), 1);
        assert_eq!(gain_code(2).unwrap(), 2);
        assert_eq!(gain_code(5).unwrap(), 3);
        assert_eq!(gain_code(10).unwrap(), 4);
        assert!(gain_code(3).is_err());
    }

    #[test]
    fn fla_config_from_params() {
        let params: HashMap<String, String> = [
            ("gain".to_string(), "5".to_string()),
            ("wr_len".to_string(), "1.00".to_string()),
        ]
        .into_iter()
        .collect();
        let config = FlaConfig::from_params(&params).unwrap();
        assert_eq!(config.gain, Some(5));
        assert_eq!(config.window.as_deref(), Some("1.00"));
        assert!(config.resolution.is_none());
        assert!(!config.is_empty());

        let bad_gain: HashMap<String, String> =
            [("gain".to_string(), "3".to_string())].into_iter().collect();
        assert!(FlaConfig::from_params(&bad_gain).is_err());

        assert!(FlaConfig::from_params(&HashMap::new()).unwrap().is_empty());
    }

    #[test]
    fn configuration_commands() {
        assert_eq!(resolution_command("1"), "SR_1");
        assert_eq!(gain_command(10).unwrap(), "G_4");
        assert_eq!(window_command("1.00"), "WR_01.00");
        assert_eq!(center_command("6.0"), "X_006.0");
        assert!(is_ack("SET OK"));
        assert!(!is_ack("SET FAIL"));
        assert!(is_error_reply("ERR: bad arg"));
    }
}
