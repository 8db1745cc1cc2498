//! Instrument Response Frame Codec
//!
//! The OFDR instrument answers an auto-peak command with a single ASCII frame:
//!
//! ```text
//! OP_1.012_2.110_3.291_5.676_8.163_-79.197_-76.391_-68.657_-68.236_-73.937_9_SN9II1_405.668_PO
//! ^^ peak values (positions, then amplitudes)         count ^  serial ^    scalar ^      ^^
//! ```
//!
//! Fields are split on `_`. The layout is driven from the end of the frame:
//! the last three fields are always the unsigned count, the serial-number token
//! and the trailing scalar, and everything before them is the peak list. That
//! keeps the short form (`OP_21.275_-57.128_9_SN9II1_97.404_PO`) and the long
//! form on one code path.
//!
//! Decoding is all-or-nothing: any malformed token yields a [`FrameError`] and
//! no partial [`MeasurementResult`].
//!
//! Two policies are configurable through [`FrameOptions`]:
//! - [`CountValidation`] decides whether the declared count must match the
//!   number of decoded peaks. Real instrument frames declare `9` regardless of
//!   the peak list length, so the default only records it.
//! - [`ChecksumPolicy`] verifies the scalar against the instrument's checksum
//!   rule (sum of absolute peak values, serial digits and count).

use crate::error::ControlError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

/// Leading marker of every response frame.
pub const FRAME_START: &str = "OP_";
/// Trailing marker of every response frame.
pub const FRAME_END: &str = "_PO";
/// Field separator inside the frame body.
pub const FIELD_DELIMITER: char = '_';

/// Signed decimal without exponent (`-68.657`, `9`, `+.5`).
static DECIMAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)$").expect("Invalid decimal regex")
});

/// Alphanumeric token containing at least one letter (`SN9II1`).
static SERIAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]*[A-Za-z][A-Za-z0-9]*$").expect("Invalid serial regex")
});

/// One decoded peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Distance along the fibre, in metres.
    pub position: f64,
    /// Reflection amplitude in dB, absent for position-only layouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amplitude: Option<f64>,
}

/// Decoded contents of a valid frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResult {
    /// Peaks in frame order.
    pub peaks: Vec<Peak>,
    /// Count token as declared by the instrument.
    pub peak_count: u32,
    /// Device serial-number token, including its `SN` prefix.
    pub serial: String,
    /// Trailing scalar (the instrument's checksum / total).
    pub scalar: f64,
}

impl MeasurementResult {
    /// Raw peak values in wire order: all positions, then all amplitudes.
    pub fn peak_values(&self) -> Vec<f64> {
        let positions = self.peaks.iter().map(|p| p.position);
        let amplitudes = self.peaks.iter().filter_map(|p| p.amplitude);
        positions.chain(amplitudes).collect()
    }

    /// Position of the farthest peak, used as the end-point of a fibre link.
    pub fn last_position(&self) -> Option<f64> {
        self.peaks.last().map(|p| p.position)
    }
}

/// How peak values are grouped into [`Peak`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakLayout {
    /// Two fields per peak: the first half of the values are positions, the
    /// second half the matching amplitudes.
    #[default]
    Paired,
    /// One field per peak: every value is a position.
    PositionsOnly,
}

impl PeakLayout {
    /// Number of frame fields that make up one peak.
    pub fn fields_per_peak(&self) -> usize {
        match self {
            PeakLayout::Paired => 2,
            PeakLayout::PositionsOnly => 1,
        }
    }
}

/// Relationship enforced between the count token and the decoded peaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountValidation {
    /// Record the declared count without checking it.
    #[default]
    Declared,
    /// Decoded peaks must equal the declared count.
    Exact,
    /// Decoded peaks must not exceed the declared count.
    AtMost,
}

/// Whether the trailing scalar is checked against the checksum rule.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ChecksumPolicy {
    /// Scalar is taken as-is.
    #[default]
    Off,
    /// Scalar must match [`frame_checksum`] within `tolerance`.
    Verify {
        /// Largest accepted absolute difference.
        tolerance: f64,
    },
}

/// Decoding options.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameOptions {
    /// Peak grouping.
    pub layout: PeakLayout,
    /// Count enforcement.
    pub count_validation: CountValidation,
    /// Scalar verification.
    pub checksum: ChecksumPolicy,
}

impl FrameOptions {
    /// Options with a different peak layout.
    pub fn with_layout(mut self, layout: PeakLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Options with a different count policy.
    pub fn with_count_validation(mut self, count_validation: CountValidation) -> Self {
        self.count_validation = count_validation;
        self
    }

    /// Options with a different checksum policy.
    pub fn with_checksum(mut self, checksum: ChecksumPolicy) -> Self {
        self.checksum = checksum;
        self
    }
}

/// Reasons a frame is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    /// Frame does not begin with `OP_`.
    #[error("missing start marker '{FRAME_START}'")]
    MissingStartMarker,
    /// Frame does not end with `_PO`.
    #[error("missing end marker '{FRAME_END}'")]
    MissingEndMarker,
    /// Nothing between the markers.
    #[error("empty frame body")]
    EmptyBody,
    /// Fewer than count, serial and scalar fields.
    #[error("expected at least 3 fields, found {0}")]
    TooFewFields(usize),
    /// A field that must be a signed decimal is not one.
    #[error("field {index} is not a number: '{token}'")]
    InvalidNumber {
        /// Zero-based field index in the body.
        index: usize,
        /// Offending token.
        token: String,
    },
    /// Count field is not an unsigned integer.
    #[error("invalid count field: '{0}'")]
    InvalidCount(String),
    /// Serial field is missing or numeric-only.
    #[error("invalid serial-number field: '{0}'")]
    InvalidSerial(String),
    /// Paired layout with an odd number of values.
    #[error("{0} peak values cannot be paired")]
    UnpairedValues(usize),
    /// Count policy violated.
    #[error("declared count {declared} does not match {decoded} decoded peaks")]
    CountMismatch {
        /// Count token value.
        declared: u32,
        /// Number of decoded peaks.
        decoded: usize,
    },
    /// Checksum policy violated.
    #[error("checksum mismatch: expected {expected:.3}, frame carries {actual:.3}")]
    ChecksumMismatch {
        /// Value computed from the frame fields.
        expected: f64,
        /// Scalar carried by the frame.
        actual: f64,
    },
}

impl From<FrameError> for ControlError {
    fn from(value: FrameError) -> Self {
        ControlError::ProtocolFault(value.to_string())
    }
}

/// Decode `raw` with default options; `None` for any malformed frame.
pub fn try_parse_frame(raw: &str) -> Option<MeasurementResult> {
    decode_frame(raw, &FrameOptions::default()).ok()
}

/// Decode `raw` according to `options`.
pub fn decode_frame(raw: &str, options: &FrameOptions) -> Result<MeasurementResult, FrameError> {
    let frame = raw.trim();
    if !frame.starts_with(FRAME_START) {
        return Err(FrameError::MissingStartMarker);
    }
    if frame.len() <= FRAME_START.len() + FRAME_END.len() {
        return Err(FrameError::EmptyBody);
    }
    if !frame.ends_with(FRAME_END) {
        return Err(FrameError::MissingEndMarker);
    }

    let body = &frame[FRAME_START.len()..frame.len() - FRAME_END.len()];
    let tokens: Vec<&str> = body.split(FIELD_DELIMITER).collect();
    if tokens.len() < 3 {
        return Err(FrameError::TooFewFields(tokens.len()));
    }

    let tail = tokens.len() - 3;
    let values = tokens[..tail]
        .iter()
        .enumerate()
        .map(|(index, token)| parse_decimal(index, token))
        .collect::<Result<Vec<_>, _>>()?;
    let peak_count = parse_count(tokens[tail])?;
    let serial = parse_serial(tokens[tail + 1])?;
    let scalar = parse_decimal(tail + 2, tokens[tail + 2])?;

    let peaks = arrange_peaks(&values, options.layout)?;

    let decoded = peaks.len();
    let count_ok = match options.count_validation {
        CountValidation::Declared => true,
        CountValidation::Exact => decoded == peak_count as usize,
        CountValidation::AtMost => decoded <= peak_count as usize,
    };
    if !count_ok {
        return Err(FrameError::CountMismatch {
            declared: peak_count,
            decoded,
        });
    }

    if let ChecksumPolicy::Verify { tolerance } = options.checksum {
        let expected = frame_checksum(&values, serial, peak_count);
        if (expected - scalar).abs() > tolerance {
            return Err(FrameError::ChecksumMismatch {
                expected,
                actual: scalar,
            });
        }
    }

    Ok(MeasurementResult {
        peaks,
        peak_count,
        serial: serial.to_string(),
        scalar,
    })
}

/// Re-emit a result in the frame grammar, three decimals per number.
pub fn encode_frame(result: &MeasurementResult) -> String {
    let mut fields: Vec<String> = result
        .peak_values()
        .iter()
        .map(|v| format!("{v:.3}"))
        .collect();
    fields.push(result.peak_count.to_string());
    fields.push(result.serial.clone());
    fields.push(format!("{:.3}", result.scalar));

    format!(
        "{FRAME_START}{}{FRAME_END}",
        fields.join(&FIELD_DELIMITER.to_string())
    )
}

/// Instrument checksum: Σ|values| + Σ serial digits + count.
pub fn frame_checksum(values: &[f64], serial: &str, count: u32) -> f64 {
    let magnitude: f64 = values.iter().map(|v| v.abs()).sum();
    magnitude + f64::from(serial_digit_sum(serial)) + f64::from(count)
}

/// Sum of every decimal digit in a serial token (`SN9II1` → 10).
pub fn serial_digit_sum(serial: &str) -> u32 {
    serial.chars().filter_map(|c| c.to_digit(10)).sum()
}

/// True when `token` is a valid serial-number token.
pub fn is_serial_token(token: &str) -> bool {
    SERIAL_REGEX.is_match(token)
}

/// True when `token` is a signed decimal in the frame grammar.
pub fn is_decimal_token(token: &str) -> bool {
    DECIMAL_REGEX.is_match(token)
}

fn parse_decimal(index: usize, token: &str) -> Result<f64, FrameError> {
    let invalid = || FrameError::InvalidNumber {
        index,
        token: token.to_string(),
    };
    if !is_decimal_token(token) {
        return Err(invalid());
    }
    token.parse::<f64>().map_err(|_| invalid())
}

fn parse_count(token: &str) -> Result<u32, FrameError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::InvalidCount(token.to_string()));
    }
    token
        .parse::<u32>()
        .map_err(|_| FrameError::InvalidCount(token.to_string()))
}

fn parse_serial(token: &str) -> Result<&str, FrameError> {
    if is_serial_token(token) {
        Ok(token)
    } else {
        Err(FrameError::InvalidSerial(token.to_string()))
    }
}

fn arrange_peaks(values: &[f64], layout: PeakLayout) -> Result<Vec<Peak>, FrameError> {
    let per_peak = layout.fields_per_peak();
    if values.len() % per_peak != 0 {
        return Err(FrameError::UnpairedValues(values.len()));
    }
    let (positions, amplitudes) = values.split_at(values.len() / per_peak);
    let peaks = match layout {
        PeakLayout::PositionsOnly => positions
            .iter()
            .map(|&position| Peak {
                position,
                amplitude: None,
            })
            .collect(),
        PeakLayout::Paired => positions
            .iter()
            .zip(amplitudes)
            .map(|(&position, &amplitude)| Peak {
                position,
                amplitude: Some(amplitude),
            })
            .collect(),
    };
    Ok(peaks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_FRAME: &str =
        "OP_1.012_2.110_3.291_5.676_8.163_-79.197_-76.391_-68.657_-68.236_-73.937_9_SN9II1_405.668_PO";
    const SHORT_FRAME: &str = "OP_21.275_-57.128_9_SN9II1_97.404_PO";

    fn verify() -> FrameOptions {
        FrameOptions::default().with_checksum(ChecksumPolicy::Verify { tolerance: 0.1 })
    }

    #[test]
    fn decodes_long_instrument_frame() {
        let result = try_parse_frame(LONG_FRAME).expect("long frame should decode");

        assert_eq!(result.peak_count, 9);
        assert_eq!(result.serial, "SN9II1");
        assert_eq!(result.scalar, 405.668);
        assert_eq!(result.peaks.len(), 5);
        assert_eq!(
            result.peaks[0],
            Peak {
                position: 1.012,
                amplitude: Some(-79.197)
            }
        );
        assert_eq!(result.last_position(), Some(8.163));
    }

    #[test]
    fn decodes_short_instrument_frame() {
        let result = try_parse_frame(SHORT_FRAME).expect("short frame should decode");

        assert_eq!(result.peak_count, 9);
        assert_eq!(result.peaks.len(), 1);
        assert_eq!(result.peaks[0].position, 21.275);
        assert_eq!(result.peaks[0].amplitude, Some(-57.128));
        assert_eq!(result.scalar, 97.404);
    }

    #[test]
    fn instrument_frames_pass_checksum_verification() {
        assert!(decode_frame(LONG_FRAME, &verify()).is_ok());
        assert!(decode_frame(SHORT_FRAME, &verify()).is_ok());
    }

    #[test]
    fn tampered_scalar_fails_checksum() {
        let tampered = SHORT_FRAME.replace("97.404", "98.404");
        let err = decode_frame(&tampered, &verify()).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
        // Without verification the same frame is accepted.
        assert!(try_parse_frame(&tampered).is_some());
    }

    #[test]
    fn exact_count_policy_rejects_short_peak_lists() {
        let exact = FrameOptions::default().with_count_validation(CountValidation::Exact);
        assert_eq!(
            decode_frame(SHORT_FRAME, &exact).unwrap_err(),
            FrameError::CountMismatch {
                declared: 9,
                decoded: 1
            }
        );

        let two_peaks = "OP_1.5_2.5_-60.1_-61.2_2_SN9II1_129.300_PO";
        assert_eq!(decode_frame(two_peaks, &exact).unwrap().peaks.len(), 2);
    }

    #[test]
    fn at_most_policy_accepts_fewer_peaks() {
        let at_most = FrameOptions::default().with_count_validation(CountValidation::AtMost);
        assert!(decode_frame(LONG_FRAME, &at_most).is_ok());

        let too_many = "OP_1.0_2.0_-60.0_-61.0_1_SN1A_0.0_PO";
        assert!(matches!(
            decode_frame(too_many, &at_most),
            Err(FrameError::CountMismatch { .. })
        ));
    }

    #[test]
    fn rejects_corrupted_markers() {
        assert_eq!(
            decode_frame("XP_21.275_-57.128_9_SN9II1_97.404_PO", &FrameOptions::default()),
            Err(FrameError::MissingStartMarker)
        );
        assert_eq!(
            decode_frame("OP_21.275_-57.128_9_SN9II1_97.404_P0", &FrameOptions::default()),
            Err(FrameError::MissingEndMarker)
        );
        assert_eq!(
            decode_frame("OP__PO", &FrameOptions::default()),
            Err(FrameError::EmptyBody)
        );
        assert!(try_parse_frame("").is_none());
    }

    #[test]
    fn rejects_truncated_body() {
        assert_eq!(
            decode_frame("OP_SN9II1_97.404_PO", &FrameOptions::default()),
            Err(FrameError::TooFewFields(2))
        );
        // Frame cut before the end marker.
        assert!(try_parse_frame("OP_21.275_-57.128_9_SN9II1_97.4").is_none());
    }

    #[test]
    fn rejects_non_numeric_fields() {
        let err = decode_frame("OP_21.275_abc_9_SN9II1_97.404_PO", &FrameOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::InvalidNumber {
                index: 1,
                token: "abc".into()
            }
        );

        assert!(try_parse_frame("OP_21.275_-57.128_9_SN9II1_inf_PO").is_none());
        assert!(try_parse_frame("OP_1e3_-57.128_9_SN9II1_97.404_PO").is_none());
        assert!(try_parse_frame("OP_21.275__9_SN9II1_97.404_PO").is_none());
    }

    #[test]
    fn rejects_bad_count_and_serial_tokens() {
        assert_eq!(
            decode_frame("OP_21.275_-57.128_-9_SN9II1_97.404_PO", &FrameOptions::default()),
            Err(FrameError::InvalidCount("-9".into()))
        );
        assert_eq!(
            decode_frame("OP_21.275_-57.128_9_12345_97.404_PO", &FrameOptions::default()),
            Err(FrameError::InvalidSerial("12345".into()))
        );
        assert_eq!(
            decode_frame("OP_21.275_-57.128_9_SN-1_97.404_PO", &FrameOptions::default()),
            Err(FrameError::InvalidSerial("SN-1".into()))
        );
    }

    #[test]
    fn paired_layout_rejects_odd_value_count() {
        let odd = "OP_1.0_2.0_-60.0_3_SN1A_66.000_PO";
        assert_eq!(
            decode_frame(odd, &FrameOptions::default()),
            Err(FrameError::UnpairedValues(3))
        );

        assert_eq!(PeakLayout::Paired.fields_per_peak(), 2);
        let positions = FrameOptions::default().with_layout(PeakLayout::PositionsOnly);
        let result = decode_frame(odd, &positions).unwrap();
        assert_eq!(result.peaks.len(), 3);
        assert!(result.peaks.iter().all(|p| p.amplitude.is_none()));
    }

    #[test]
    fn accepts_frame_without_peaks() {
        let result = try_parse_frame("OP_0_SN1A_1.000_PO").unwrap();
        assert!(result.peaks.is_empty());
        assert_eq!(result.peak_count, 0);
    }

    #[test]
    fn trims_line_terminators() {
        let framed = format!("{SHORT_FRAME}\r\n");
        assert!(try_parse_frame(&framed).is_some());
    }

    #[test]
    fn decoding_is_idempotent() {
        assert_eq!(try_parse_frame(LONG_FRAME), try_parse_frame(LONG_FRAME));
    }

    #[test]
    fn encoded_result_decodes_to_the_same_value() {
        let result = try_parse_frame(LONG_FRAME).unwrap();
        let encoded = encode_frame(&result);
        assert_eq!(encoded, LONG_FRAME);
        assert_eq!(try_parse_frame(&encoded), Some(result));
    }

    #[test]
    fn checksum_matches_instrument_rule() {
        let checksum = frame_checksum(&[21.275, -57.128], "SN9II1", 9);
        assert!((checksum - 97.403).abs() < 1e-9);
        assert_eq!(serial_digit_sum("SN9II1"), 10);
    }
}
