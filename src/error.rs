//! Error types for instrument sessions.
//!
//! This module defines `MeasureError`, the single error type a measurement
//! resolves with. Using the `thiserror` crate, it splits failures into the
//! categories a caller can act on:
//!
//! - **`Connect`**: the TCP connection could not be established (timeout,
//!   refusal, DNS or any other socket failure). Also used when the socket
//!   fails while a reply is being read.
//! - **`Write`**: the command payload could not be written or flushed.
//! - **`Timeout`**: the session deadline elapsed before a complete reply
//!   arrived. Any partially accumulated bytes are discarded.
//! - **`Parse`**: the reply was structurally malformed. Wraps a
//!   [`ParseError`] and an excerpt of the raw buffer.
//! - **`Decode`**: the reply was well-framed but its calibration fields
//!   could not be turned into numbers. Wraps a [`DecodeError`].
//!
//! No variant is ever retried inside the crate; the caller decides.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results of a measurement.
pub type MeasureResult<T> = std::result::Result<T, MeasureError>;

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// No connection within the endpoint timeout.
    Timeout,
    /// The instrument actively refused the connection.
    Refused,
    /// The established connection was reset or broke while reading.
    Reset,
    /// Any other socket or resolution failure.
    Other(String),
}

impl ConnectFailure {
    /// Classify an I/O error raised while connecting or reading.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ConnectFailure::Timeout,
            ErrorKind::ConnectionRefused => ConnectFailure::Refused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ConnectFailure::Reset
            }
            _ => ConnectFailure::Other(err.to_string()),
        }
    }

    /// Short machine-readable label.
    pub fn reason(&self) -> &str {
        match self {
            ConnectFailure::Timeout => "timeout",
            ConnectFailure::Refused => "refused",
            ConnectFailure::Reset => "reset",
            ConnectFailure::Other(msg) => msg,
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

// =============================================================================
// Response Errors
// =============================================================================

/// Structural problems found while splitting a reply into header and samples.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("response buffer is empty")]
    Empty,

    #[error("no binary block marker '#' in response")]
    NoBinaryMarker,

    #[error("expected at least 4 header lines before the binary block, got {got}")]
    InsufficientHeaderLines { got: usize },

    #[error("character after '#' is not a decimal digit")]
    BadDigitCount,

    #[error("waveform preamble has {field_count} fields, expected at least 10")]
    IncompletePreamble { field_count: usize },
}

impl ParseError {
    /// Stable label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::Empty => "empty",
            ParseError::NoBinaryMarker => "no_binary_marker",
            ParseError::InsufficientHeaderLines { .. } => "insufficient_header_lines",
            ParseError::BadDigitCount => "bad_digit_count",
            ParseError::IncompletePreamble { .. } => "incomplete_preamble",
        }
    }
}

/// Calibration fields that could not be turned into numbers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("header line {index} ({field}) is missing")]
    MissingHeaderLine { index: usize, field: &'static str },

    #[error("{field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

// =============================================================================
// Session Errors
// =============================================================================

/// Terminal failure of one measurement session.
#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("connection to {address} failed: {reason}")]
    Connect {
        address: String,
        reason: ConnectFailure,
    },

    #[error("write to {address} failed: {source}")]
    Write {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no complete response from {address} within {timeout_ms} ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("malformed response: {source} (received: \"{excerpt}\")")]
    Parse {
        #[source]
        source: ParseError,
        excerpt: String,
    },

    #[error("cannot decode waveform: {source} (received: \"{excerpt}\")")]
    Decode {
        #[source]
        source: DecodeError,
        excerpt: String,
    },
}

impl MeasureError {
    /// Taxonomy label: `connect`, `write`, `timeout`, `parse` or `decode`.
    pub fn kind(&self) -> &'static str {
        match self {
            MeasureError::Connect { .. } => "connect",
            MeasureError::Write { .. } => "write",
            MeasureError::Timeout { .. } => "timeout",
            MeasureError::Parse { .. } => "parse",
            MeasureError::Decode { .. } => "decode",
        }
    }

    /// The parse failure, if this is one.
    pub fn parse_error(&self) -> Option<&ParseError> {
        match self {
            MeasureError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}
