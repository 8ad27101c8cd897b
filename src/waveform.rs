//! Waveform decoding and derived metrics.
//!
//! Raw samples are unsigned bytes. Each one maps to a voltage through the
//! preamble calibration:
//!
//! ```text
//! v[i] = (raw[i] - y_reference) * y_increment + y_origin
//! ```
//!
//! The screen is 10 horizontal by 8 vertical divisions.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::parser::{ParsedHeader, ParsedResponse, PREAMBLE_LINE};

/// Horizontal divisions on the instrument screen.
pub const HORIZONTAL_DIVISIONS: f64 = 10.0;

/// Vertical divisions on the instrument screen.
pub const VERTICAL_DIVISIONS: f64 = 8.0;

/// Readings above this magnitude are the instrument's "no signal" value.
pub const SENTINEL_LIMIT: f64 = 1e30;

const SCALE_LINE: usize = 0;
const PEAK_TO_PEAK_LINE: usize = 1;
const FREQUENCY_LINE: usize = 2;

const X_INCREMENT_FIELD: usize = 4;
const Y_INCREMENT_FIELD: usize = 7;
const Y_ORIGIN_FIELD: usize = 8;
const Y_REFERENCE_FIELD: usize = 9;

/// Sample-to-voltage and sample-to-time calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationParams {
    /// Seconds between samples.
    pub x_increment: f64,
    /// Volts per raw count.
    pub y_increment: f64,
    /// Voltage offset added after scaling.
    pub y_origin: f64,
    /// Raw count corresponding to `y_origin`.
    pub y_reference: f64,
    /// Vertical scale setting in volts per division.
    pub voltage_scale_per_div: f64,
}

impl CalibrationParams {
    /// Read calibration from the scale line and the preamble.
    pub fn from_header(header: &ParsedHeader) -> Result<Self, DecodeError> {
        let scale = header.line(SCALE_LINE).ok_or(DecodeError::MissingHeaderLine {
            index: SCALE_LINE,
            field: "vertical scale",
        })?;
        if header.line(PREAMBLE_LINE).is_none() {
            return Err(DecodeError::MissingHeaderLine {
                index: PREAMBLE_LINE,
                field: "preamble",
            });
        }
        let fields = header.preamble_fields();

        Ok(Self {
            x_increment: preamble_number(&fields, X_INCREMENT_FIELD, "x increment")?,
            y_increment: preamble_number(&fields, Y_INCREMENT_FIELD, "y increment")?,
            y_origin: preamble_number(&fields, Y_ORIGIN_FIELD, "y origin")?,
            y_reference: preamble_number(&fields, Y_REFERENCE_FIELD, "y reference")?,
            voltage_scale_per_div: number(scale, "vertical scale")?,
        })
    }

    /// Voltage of one raw sample.
    #[inline]
    pub fn voltage(&self, raw: u8) -> f64 {
        (f64::from(raw) - self.y_reference) * self.y_increment + self.y_origin
    }
}

/// Instrument-side measurements reported alongside the samples.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarReadings {
    /// Peak-to-peak voltage, sentinel-normalized.
    pub peak_to_peak: f64,
    /// Frequency in hertz, sentinel-normalized.
    pub frequency_hz: f64,
}

impl ScalarReadings {
    /// Read Vpp and frequency lines; missing or garbled text becomes 0.
    pub fn from_header(header: &ParsedHeader) -> Self {
        Self {
            peak_to_peak: normalize_metric(header.line(PEAK_TO_PEAK_LINE).unwrap_or_default()),
            frequency_hz: normalize_metric(header.line(FREQUENCY_LINE).unwrap_or_default()),
        }
    }
}

/// A calibrated capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedWaveform {
    /// Voltages, one per raw sample, in order.
    pub samples: Vec<f64>,
    /// Seconds per horizontal division.
    pub time_per_div: f64,
    /// Volts per vertical division.
    pub voltage_per_div: f64,
    /// Vertical origin reported by the instrument.
    pub voltage_offset: f64,
    /// Instrument-measured peak-to-peak voltage (0 if no signal).
    pub peak_to_peak_voltage: f64,
    /// Instrument-measured frequency (0 if no signal).
    pub frequency_hz: f64,
    /// Seconds between consecutive samples.
    pub sample_interval: f64,
}

impl DecodedWaveform {
    /// Number of samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Full-screen voltage span.
    pub fn vertical_range(&self) -> f64 {
        self.voltage_per_div * VERTICAL_DIVISIONS
    }

    /// Samples as a fraction of screen height, 0.5 at zero volts.
    ///
    /// A zero vertical scale yields non-finite values.
    pub fn normalized_samples(&self) -> Vec<f64> {
        let range = self.vertical_range();
        self.samples.iter().map(|v| v / range + 0.5).collect()
    }

    /// Time offset of every sample from the first.
    pub fn sample_times(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.samples.len()).map(move |i| i as f64 * self.sample_interval)
    }

    /// Smallest sample, if any.
    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    /// Largest sample, if any.
    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }

    /// Peak-to-peak computed from the samples themselves.
    pub fn measured_peak_to_peak(&self) -> Option<f64> {
        Some(self.max()? - self.min()?)
    }
}

/// Calibrate raw samples and derive screen metrics.
pub fn decode(raw: &[u8], calibration: &CalibrationParams, readings: ScalarReadings) -> DecodedWaveform {
    let samples: Vec<f64> = raw.iter().map(|&b| calibration.voltage(b)).collect();
    let time_per_div = calibration.x_increment * samples.len() as f64 / HORIZONTAL_DIVISIONS;

    DecodedWaveform {
        samples,
        time_per_div,
        voltage_per_div: calibration.voltage_scale_per_div,
        voltage_offset: calibration.y_origin,
        peak_to_peak_voltage: readings.peak_to_peak,
        frequency_hz: readings.frequency_hz,
        sample_interval: calibration.x_increment,
    }
}

/// Decode a parsed reply end to end.
pub fn decode_response(response: &ParsedResponse<'_>) -> Result<DecodedWaveform, DecodeError> {
    let calibration = CalibrationParams::from_header(&response.header)?;
    let readings = ScalarReadings::from_header(&response.header);
    Ok(decode(response.samples, &calibration, readings))
}

/// Parse an instrument reading, mapping NaN and overflow sentinels to 0.
pub fn normalize_metric(text: &str) -> f64 {
    let value = text.trim().parse::<f64>().unwrap_or(f64::NAN);
    if value.is_nan() || value.abs() > SENTINEL_LIMIT {
        0.0
    } else {
        value
    }
}

fn number(text: &str, field: &'static str) -> Result<f64, DecodeError> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| !v.is_nan())
        .ok_or_else(|| DecodeError::InvalidNumber {
            field,
            value: text.to_owned(),
        })
}

fn preamble_number(fields: &[&str], index: usize, field: &'static str) -> Result<f64, DecodeError> {
    let text = fields.get(index).copied().unwrap_or_default();
    number(text, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn calibration() -> CalibrationParams {
        CalibrationParams {
            x_increment: 0.001,
            y_increment: 0.04,
            y_origin: 0.0,
            y_reference: 128.0,
            voltage_scale_per_div: 1.0,
        }
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn applies_calibration_per_sample() {
        let raw: Vec<u8> = vec![0, 118, 128, 138, 255];
        let wf = decode(&raw, &calibration(), ScalarReadings::default());

        assert_eq!(wf.sample_count(), raw.len());
        for (sample, &b) in wf.samples.iter().zip(&raw) {
            assert_close(*sample, (f64::from(b) - 128.0) * 0.04);
        }
        assert_close(wf.samples[1], -0.4);
        assert_close(wf.time_per_div, 0.001 * 5.0 / 10.0);
    }

    #[test]
    fn honours_origin_offset() {
        let cal = CalibrationParams {
            y_origin: 1.5,
            ..calibration()
        };
        let wf = decode(&[128], &cal, ScalarReadings::default());
        assert_close(wf.samples[0], 1.5);
        assert_close(wf.voltage_offset, 1.5);
    }

    #[test]
    fn normalizes_sentinels() {
        assert_eq!(normalize_metric("9.9E37"), 0.0);
        assert_eq!(normalize_metric("-9.9E37"), 0.0);
        assert_eq!(normalize_metric("****"), 0.0);
        assert_eq!(normalize_metric("NaN"), 0.0);
        assert_eq!(normalize_metric(""), 0.0);
        assert_eq!(normalize_metric(" 2.5e0 "), 2.5);
        assert_eq!(normalize_metric("1e30"), 1e30);
    }

    #[test]
    fn decodes_parsed_reply() {
        let mut buf = b"1.0\n9.9E37\n1000.0\n0,0,0,0,0.001,0,0,0.04,0,128\n#210".to_vec();
        buf.extend((0..10u8).map(|i| 118 + 2 * i));
        buf.extend_from_slice(&[138; 10]);

        let parsed = parse(&buf).unwrap();
        let wf = decode_response(&parsed).unwrap();

        assert_eq!(wf.sample_count(), 20);
        assert_close(wf.voltage_per_div, 1.0);
        assert_close(wf.time_per_div, 0.002);
        assert_eq!(wf.peak_to_peak_voltage, 0.0);
        assert_close(wf.frequency_hz, 1000.0);
        assert_close(wf.samples[0], -0.4);
        assert_close(wf.measured_peak_to_peak().unwrap(), 0.8);
    }

    #[test]
    fn rejects_garbled_calibration() {
        let buf = b"abc\n2.5\n1000.0\n0,0,0,0,0.001,0,0,0.04,0,128\n#10";
        let parsed = parse(buf).unwrap();
        assert_eq!(
            decode_response(&parsed),
            Err(DecodeError::InvalidNumber {
                field: "vertical scale",
                value: "abc".into()
            })
        );

        let buf = b"1.0\n2.5\n1000.0\n0,0,0,0,fast,0,0,0.04,0,128\n#10";
        let parsed = parse(buf).unwrap();
        assert!(matches!(
            decode_response(&parsed),
            Err(DecodeError::InvalidNumber { field: "x increment", .. })
        ));
    }

    #[test]
    fn screen_helpers() {
        let wf = decode(&[128, 228, 28], &calibration(), ScalarReadings::default());
        assert_close(wf.vertical_range(), 8.0);
        let normalized = wf.normalized_samples();
        assert_close(normalized[0], 0.5);
        assert_close(normalized[1], 0.5 + 4.0 / 8.0);
        assert_close(normalized[2], 0.5 - 4.0 / 8.0);

        let times: Vec<f64> = wf.sample_times().collect();
        assert_close(times[2], 0.002);
    }

    #[test]
    fn empty_capture_has_no_extrema() {
        let wf = decode(&[], &calibration(), ScalarReadings::default());
        assert_eq!(wf.min(), None);
        assert_eq!(wf.measured_peak_to_peak(), None);
        assert_eq!(wf.time_per_div, 0.0);
    }
}
