//! # Board DAQ Core Library
//!
//! Instrument communication for a board diagnostic workbench. A session
//! opens a raw TCP connection to a lab instrument, writes SCPI commands,
//! reassembles the streamed reply and decodes it. Oscilloscope replies mix
//! ASCII header lines with an IEEE 488.2 binary block and decode into a
//! calibrated waveform. Multimeter replies are single text readings.
//!
//! ## Crate Structure
//!
//! - **`transport`**: `Connector`/`Channel` traits and the TCP implementation.
//! - **`accumulator`**: `FrameAccumulator`, which collects chunks and decides
//!   when a reply is complete.
//! - **`parser`**: splits a complete reply into header lines and sample bytes.
//! - **`waveform`**: calibration and decoding into `DecodedWaveform`.
//! - **`session`**: the `InstrumentSession` state machine driving one request.
//! - **`scpi`**: command programs for the scope and the multimeter.
//! - **`report`**: JSON records of measurement outcomes.
//! - **`config`**: layered bench configuration (defaults, TOML, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`mock`**: a scripted loopback instrument for tests and demos.
//! - **`error`**: the `MeasureError` taxonomy.

pub mod accumulator;
pub mod config;
pub mod error;
pub mod logging;
pub mod mock;
pub mod parser;
pub mod report;
pub mod scpi;
pub mod session;
pub mod transport;
pub mod waveform;

pub use error::{ConnectFailure, DecodeError, MeasureError, MeasureResult, ParseError};
pub use report::{MeasurementReport, ReportStatus};
pub use session::{configure, measure_reading, measure_waveform, InstrumentSession, Outcome, SessionState};
pub use transport::InstrumentEndpoint;
pub use waveform::{CalibrationParams, DecodedWaveform};
