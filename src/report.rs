//! JSON-serializable measurement records.
//!
//! The UI and persistence layers store these as opaque records. Every
//! record carries a `status` of `success` or `error`; errors add a `kind`
//! and a human-readable `message`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MeasureError, MeasureResult};
use crate::scpi::parse_reading;
use crate::waveform::DecodedWaveform;

/// Whether the measurement succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// The measurement produced a value.
    Success,
    /// The measurement failed; see `kind` and `message`.
    Error,
}

/// Outcome of one measurement, ready for storage or display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementReport {
    /// Success or error.
    pub status: ReportStatus,
    /// When the session resolved.
    pub captured_at: DateTime<Utc>,
    /// Error taxonomy label (`connect`, `timeout`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Decoded oscilloscope capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform: Option<DecodedWaveform>,
    /// Raw multimeter reading text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading: Option<String>,
    /// Numeric value of the reading, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MeasurementReport {
    fn success() -> Self {
        Self {
            status: ReportStatus::Success,
            captured_at: Utc::now(),
            kind: None,
            message: None,
            waveform: None,
            reading: None,
            value: None,
        }
    }

    /// Report for a failed session.
    pub fn from_error(err: &MeasureError) -> Self {
        Self {
            status: ReportStatus::Error,
            kind: Some(err.kind().to_string()),
            message: Some(err.to_string()),
            ..Self::success()
        }
    }

    /// Report for an oscilloscope capture.
    pub fn from_waveform(result: &MeasureResult<DecodedWaveform>) -> Self {
        match result {
            Ok(waveform) => Self {
                waveform: Some(waveform.clone()),
                ..Self::success()
            },
            Err(err) => Self::from_error(err),
        }
    }

    /// Report for a multimeter reading.
    pub fn from_reading(result: &MeasureResult<String>) -> Self {
        match result {
            Ok(reading) => Self {
                value: parse_reading(reading),
                reading: Some(reading.clone()),
                ..Self::success()
            },
            Err(err) => Self::from_error(err),
        }
    }

    /// Report for a configuration write.
    pub fn from_configure(result: &MeasureResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                message: Some("configured".to_string()),
                ..Self::success()
            },
            Err(err) => Self::from_error(err),
        }
    }

    /// Whether the measurement succeeded.
    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}
