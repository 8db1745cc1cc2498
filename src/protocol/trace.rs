//! Raw `SCAN` reply decoding.
//!
//! The instrument answers `SCAN` with a resolution line (`0.05m`), then
//! `ceil(window / resolution)` samples of 12 ASCII bytes each, then `!`.

use crate::protocol::frame::FrameError;
use serde::{Deserialize, Serialize};

/// Width of one sample on the wire.
pub const SAMPLE_WIDTH: usize = 12;
/// Marks the end of the sample block.
pub const TRACE_TERMINATOR: u8 = b'!';
/// Resolution assumed when the instrument's line is unreadable.
pub const DEFAULT_RESOLUTION_M: f64 = 0.05;
/// Longest window a scan may cover, metres.
pub const MAX_WINDOW_M: f64 = 300.0;
/// Most samples one trace may carry.
pub const MAX_TRACE_POINTS: usize = 1_000_000;
/// Most bytes read for one sample block, terminator included.
pub const MAX_TRACE_BYTES: usize = MAX_TRACE_POINTS * SAMPLE_WIDTH + 64;

/// Decoded `SCAN` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTrace {
    /// Sample spacing reported by the instrument, metres.
    pub resolution_m: f64,
    /// Window length the scan was configured for, metres.
    pub window_length_m: f64,
    /// Number of decoded samples.
    pub point_count: usize,
    /// Sample values.
    pub samples: Vec<f64>,
    /// Bytes received in the sample block.
    pub raw_bytes: usize,
    /// Whether the `!` terminator was seen.
    pub terminated: bool,
}

/// Resolution in metres from the first reply line, or `fallback`.
pub fn parse_resolution(line: &str, fallback: f64) -> f64 {
    let trimmed = line.trim();
    let number = trimmed
        .strip_suffix('m')
        .or_else(|| trimmed.strip_suffix('M'))
        .unwrap_or(trimmed)
        .trim();
    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => value,
        _ => fallback,
    }
}

/// Sample count the instrument sends for a window, clamped to
/// `1..=MAX_TRACE_POINTS`.
pub fn expected_points(window_m: f64, resolution_m: f64) -> usize {
    if resolution_m.is_nan() || resolution_m <= 0.0 || window_m.is_nan() || window_m <= 0.0 {
        return 1;
    }
    let points = (window_m / resolution_m).ceil();
    if !points.is_finite() || points >= MAX_TRACE_POINTS as f64 {
        return MAX_TRACE_POINTS;
    }
    (points as usize).max(1)
}

/// Decode fixed-width ASCII samples. A trailing partial chunk is ignored.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<f64>, FrameError> {
    bytes
        .chunks_exact(SAMPLE_WIDTH)
        .enumerate()
        .map(|(index, chunk)| {
            let text = String::from_utf8_lossy(chunk);
            let token = text.trim();
            token
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| FrameError::InvalidNumber {
                    index,
                    token: token.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_line_variants() {
        assert_eq!(parse_resolution("0.05m\r\n", 1.0), 0.05);
        assert_eq!(parse_resolution("0.1 M", 1.0), 0.1);
        assert_eq!(parse_resolution("0.2", 1.0), 0.2);
        assert_eq!(parse_resolution("garbage", 0.05), 0.05);
        assert_eq!(parse_resolution("-1m", 0.05), 0.05);
    }

    #[test]
    fn expected_points_rounds_up() {
        assert_eq!(expected_points(30.0, 0.05), 600);
        assert_eq!(expected_points(1.01, 0.5), 3);
        assert_eq!(expected_points(0.0, 0.05), 1);
    }

    #[test]
    fn expected_points_is_capped() {
        assert_eq!(expected_points(1e23, 0.05), MAX_TRACE_POINTS);
        assert_eq!(expected_points(f64::INFINITY, 0.05), MAX_TRACE_POINTS);
        assert_eq!(expected_points(30.0, f64::MIN_POSITIVE), MAX_TRACE_POINTS);
        assert_eq!(expected_points(MAX_WINDOW_M, DEFAULT_RESOLUTION_M), 6000);
    }

    #[test]
    fn decodes_fixed_width_samples() {
        let bytes = b"  -60.123000     1.5E-3  -70.00";
        let samples = decode_samples(bytes).unwrap();
        assert_eq!(samples, vec![-60.123, 1.5e-3]);
    }

    #[test]
    fn rejects_non_numeric_chunk() {
        let err = decode_samples(b"   -60.12300  not-a-num  ").unwrap_err();
        assert!(matches!(err, FrameError::InvalidNumber { index: 1, .. }));
    }
}
