//! SCPI command building for the bench instruments.
//!
//! The oscilloscope capture is a fixed eight-command program written in a
//! single burst. The instrument answers the queries in program order, so
//! the reply is the four scalar lines followed by the waveform block.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::waveform::SENTINEL_LIMIT;

/// Commands in one oscilloscope capture program.
pub const WAVEFORM_COMMAND_COUNT: usize = 8;

/// Highest analog channel number on the scope.
pub const MAX_SCOPE_CHANNEL: u8 = 4;

/// An analog input channel of the oscilloscope, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ScopeChannel(u8);

impl ScopeChannel {
    /// Channel `number`, if it exists on the scope.
    pub fn new(number: u8) -> Option<Self> {
        (1..=MAX_SCOPE_CHANNEL).contains(&number).then_some(Self(number))
    }

    /// 1-based channel number.
    pub fn number(self) -> u8 {
        self.0
    }
}

impl Default for ScopeChannel {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<u8> for ScopeChannel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
            .ok_or_else(|| format!("scope channel must be 1-{MAX_SCOPE_CHANNEL}, got {value}"))
    }
}

impl From<ScopeChannel> for u8 {
    fn from(channel: ScopeChannel) -> Self {
        channel.0
    }
}

impl fmt::Display for ScopeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHAN{}", self.0)
    }
}

/// The capture program for `channel`.
///
/// Source, mode and format are set first; then vertical scale, Vpp,
/// frequency and preamble are queried, and the waveform data requested.
pub fn scope_capture_sequence(channel: ScopeChannel) -> Vec<String> {
    vec![
        format!(":WAV:SOUR {channel}"),
        ":WAV:MODE NORM".to_string(),
        ":WAV:FORM BYTE".to_string(),
        format!(":{channel}:SCAL?"),
        format!(":MEAS:VPP? {channel}"),
        format!(":MEAS:FREQ? {channel}"),
        ":WAV:PRE?".to_string(),
        ":WAV:DATA?".to_string(),
    ]
}

/// Join commands into one payload, each terminated by exactly one `\n`.
pub fn encode_commands<S: AsRef<str>>(commands: &[S]) -> Bytes {
    let total: usize = commands.iter().map(|c| c.as_ref().len() + 1).sum();
    let mut payload = BytesMut::with_capacity(total);
    for command in commands {
        let command = command.as_ref().trim_end_matches(['\r', '\n']);
        payload.put_slice(command.as_bytes());
        payload.put_u8(b'\n');
    }
    payload.freeze()
}

/// Wrap `data` in an IEEE 488.2 definite-length block: `#<N><len><data>`.
pub fn encode_binary_block(data: &[u8]) -> Vec<u8> {
    let len = data.len().to_string();
    let mut block = Vec::with_capacity(2 + len.len() + data.len());
    block.push(b'#');
    block.extend_from_slice(len.len().to_string().as_bytes());
    block.extend_from_slice(len.as_bytes());
    block.extend_from_slice(data);
    block
}

// =============================================================================
// Multimeter
// =============================================================================

/// Measurement functions of the bench multimeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeterFunction {
    /// DC voltage.
    DcVoltage,
    /// AC voltage.
    AcVoltage,
    /// DC current.
    DcCurrent,
    /// AC current.
    AcCurrent,
    /// Two-wire resistance.
    Resistance,
    /// Continuity beeper.
    Continuity,
    /// Diode forward voltage.
    Diode,
    /// Frequency.
    Frequency,
    /// Capacitance.
    Capacitance,
}

impl MeterFunction {
    /// All functions, in display order.
    pub const ALL: [MeterFunction; 9] = [
        MeterFunction::DcVoltage,
        MeterFunction::AcVoltage,
        MeterFunction::DcCurrent,
        MeterFunction::AcCurrent,
        MeterFunction::Resistance,
        MeterFunction::Continuity,
        MeterFunction::Diode,
        MeterFunction::Frequency,
        MeterFunction::Capacitance,
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            MeterFunction::DcVoltage => "VOLT:DC",
            MeterFunction::AcVoltage => "VOLT:AC",
            MeterFunction::DcCurrent => "CURR:DC",
            MeterFunction::AcCurrent => "CURR:AC",
            MeterFunction::Resistance => "RES",
            MeterFunction::Continuity => "CONT",
            MeterFunction::Diode => "DIOD",
            MeterFunction::Frequency => "FREQ",
            MeterFunction::Capacitance => "CAP",
        }
    }

    /// Command that switches the meter to this function.
    pub fn configure_command(self) -> String {
        format!("CONF:{}", self.mnemonic())
    }

    /// Query that triggers and returns one reading.
    pub fn measure_query(self) -> String {
        format!("MEAS:{}?", self.mnemonic())
    }

    /// Name accepted by `FromStr`.
    pub fn name(self) -> &'static str {
        match self {
            MeterFunction::DcVoltage => "dc-voltage",
            MeterFunction::AcVoltage => "ac-voltage",
            MeterFunction::DcCurrent => "dc-current",
            MeterFunction::AcCurrent => "ac-current",
            MeterFunction::Resistance => "resistance",
            MeterFunction::Continuity => "continuity",
            MeterFunction::Diode => "diode",
            MeterFunction::Frequency => "frequency",
            MeterFunction::Capacitance => "capacitance",
        }
    }
}

impl fmt::Display for MeterFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MeterFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|f| f.name()).collect();
                format!("unknown meter function '{s}'. Must be one of: {}", names.join(", "))
            })
    }
}

/// Printable ASCII of a meter reply, trimmed.
pub fn sanitize_reading(raw: &[u8]) -> String {
    let printable: String = raw
        .iter()
        .filter(|b| (0x20..=0x7e).contains(*b))
        .map(|&b| char::from(b))
        .collect();
    printable.trim().to_string()
}

/// Numeric value of a sanitized reading; `None` for text or overload.
pub fn parse_reading(reading: &str) -> Option<f64> {
    reading
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| !v.is_nan() && v.abs() <= SENTINEL_LIMIT)
}
