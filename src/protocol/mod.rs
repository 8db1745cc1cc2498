//! Instrument wire formats.
//!
//! - [`frame`]: `OP_..._PO` auto-peak response frames.
//! - [`command`]: outbound command strings.
//! - [`trace`]: raw `SCAN` sample blocks.
//!
//! Everything here is pure and synchronous; I/O lives in [`crate::hardware`].

pub mod command;
pub mod frame;
pub mod trace;

pub use command::{AutoPeakParams, FlaConfig};
pub use frame::{
    decode_frame, encode_frame, try_parse_frame, ChecksumPolicy, CountValidation, FrameError,
    FrameOptions, MeasurementResult, Peak, PeakLayout,
};
pub use trace::ScanTrace;

use serde::{Deserialize, Serialize};

/// Payload of a successful measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementData {
    /// Auto-peak result.
    Peaks(MeasurementResult),
    /// Raw scan trace.
    Trace(ScanTrace),
    /// Fibre length derived from an auto-peak search.
    Length(LengthMeasurement),
}

/// Length derived from one peak of an auto-peak search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LengthMeasurement {
    /// Length in metres, relative to `reference_m`.
    pub length_m: f64,
    /// Amplitude of the peak the length was taken from, dB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amplitude_db: Option<f64>,
    /// Zero point subtracted from the peak position, metres.
    pub reference_m: f64,
}

/// Frame index of the peak that marks the zero point of a link.
pub const ZERO_PEAK_INDEX: usize = 2;

impl LengthMeasurement {
    fn from_peak(peak: &Peak, reference_m: f64) -> Self {
        Self {
            length_m: peak.position - reference_m,
            amplitude_db: peak.amplitude,
            reference_m,
        }
    }

    /// Length of the peak with the largest position, past `reference_m`.
    pub fn from_farthest_peak(result: &MeasurementResult, reference_m: f64) -> Option<Self> {
        result
            .peaks
            .iter()
            .max_by(|a, b| a.position.total_cmp(&b.position))
            .map(|peak| Self::from_peak(peak, reference_m))
    }

    /// Zero point of a link: the third peak in frame order, or the farthest
    /// peak when fewer than three were found.
    pub fn zero_point(result: &MeasurementResult) -> Option<Self> {
        match result.peaks.get(ZERO_PEAK_INDEX) {
            Some(peak) => Some(Self::from_peak(peak, 0.0)),
            None => Self::from_farthest_peak(result, 0.0),
        }
    }
}

impl From<MeasurementResult> for MeasurementData {
    fn from(value: MeasurementResult) -> Self {
        MeasurementData::Peaks(value)
    }
}

impl From<LengthMeasurement> for MeasurementData {
    fn from(value: LengthMeasurement) -> Self {
        MeasurementData::Length(value)
    }
}

impl From<ScanTrace> for MeasurementData {
    fn from(value: ScanTrace) -> Self {
        MeasurementData::Trace(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn farthest_peak_ignores_frame_order() {
        let result = try_parse_frame("OP_8.0_2.0_-60.0_-61.0_2_SN1A_0.0_PO").unwrap();
        let length = LengthMeasurement::from_farthest_peak(&result, 0.0).unwrap();
        assert_eq!(length.length_m, 8.0);
        assert_eq!(length.amplitude_db, Some(-60.0));

        let past_zero = LengthMeasurement::from_farthest_peak(&result, 5.5).unwrap();
        assert_eq!(past_zero.length_m, 2.5);
    }

    #[test]
    fn zero_point_prefers_third_peak() {
        let five = try_parse_frame(
            "OP_1.012_2.110_3.291_5.676_8.163_-79.197_-76.391_-68.657_-68.236_-73.937_9_SN9II1_405.668_PO",
        )
        .unwrap();
        let zero = LengthMeasurement::zero_point(&five).unwrap();
        assert_eq!(zero.length_m, 3.291);
        assert_eq!(zero.amplitude_db, Some(-68.657));

        let two = try_parse_frame("OP_8.0_2.0_-60.0_-61.0_2_SN1A_0.0_PO").unwrap();
        assert_eq!(LengthMeasurement::zero_point(&two).unwrap().length_m, 8.0);

        let none = try_parse_frame("OP_0_SN1A_1.000_PO").unwrap();
        assert!(LengthMeasurement::zero_point(&none).is_none());
    }
}
