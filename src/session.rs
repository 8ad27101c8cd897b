//! One request/response cycle against one instrument.
//!
//! # State machine
//!
//! ```text
//! Idle ──Start──> Connecting ──Connected──> AwaitingResponse ──complete / remote closed──> Decoding
//!                    │                        │    ↺ partial chunk                          │
//!                    │ ConnectFailed          │ WriteFailed, SocketFailed,                  │ Decoded
//!                    │ DeadlineElapsed        │ DeadlineElapsed                             │ ParseFailed
//!                    ▼                        ▼                                             ▼ DecodeFailed
//!                              Resolved(Success | ConnectError | WriteError |
//!                                       TimeoutError | ParseError | DecodeError)
//! ```
//!
//! [`transition`] is the whole table; the async driver only feeds it
//! events. Resolved states absorb every further event, so a session
//! resolves exactly once.
//!
//! Three request shapes share the skeleton and differ in completeness:
//!
//! - **Waveform** (oscilloscope): complete when the `#N<len>` block has
//!   fully arrived ([`BinaryBlockCompletion`]).
//! - **Reading** (multimeter): complete on the first non-empty chunk
//!   ([`FirstChunkCompletion`]).
//! - **Configure** (multimeter): complete once the write succeeds.
//!
//! The deadline starts when `Connecting` is entered and covers the connect,
//! the write and every read. The channel is closed exactly once on every
//! path, before the outcome is returned.

use std::fmt;

use bytes::Bytes;
use tokio::time::{timeout_at, Instant};
use tracing::Instrument;

use crate::accumulator::{BinaryBlockCompletion, Completion, FirstChunkCompletion, FrameAccumulator};
use crate::error::{ConnectFailure, MeasureError, MeasureResult};
use crate::parser::{excerpt, parse};
use crate::scpi::{encode_commands, sanitize_reading};
use crate::transport::{Channel, Connector, InstrumentEndpoint, TcpConnector};
use crate::waveform::{decode_response, DecodedWaveform};

/// Default deadline for an oscilloscope capture.
pub const DEFAULT_WAVEFORM_TIMEOUT_MS: u64 = 15_000;

/// Default deadline for multimeter reads and configuration writes.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2_000;

// =============================================================================
// States and transitions
// =============================================================================

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    ConnectError,
    WriteError,
    TimeoutError,
    ParseError,
    DecodeError,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingResponse,
    Decoding,
    Resolved(Outcome),
}

impl SessionState {
    /// Whether the session has reached a terminal state.
    pub fn is_resolved(self) -> bool {
        matches!(self, SessionState::Resolved(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Resolved(outcome) => write!(f, "Resolved({outcome:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// A measure or configure call began.
    Start,
    /// The socket connected.
    Connected,
    /// Connecting failed.
    ConnectFailed,
    /// Writing the command payload failed.
    WriteFailed,
    /// The command was written and no reply is expected.
    Acknowledged,
    /// A chunk was appended; `complete` is the predicate result.
    Chunk { complete: bool },
    /// The remote closed the connection.
    RemoteClosed,
    /// The socket failed while reading.
    SocketFailed,
    /// The session deadline passed.
    DeadlineElapsed,
    /// Parsing and decoding succeeded.
    Decoded,
    /// The reply was structurally malformed.
    ParseFailed,
    /// The reply could not be calibrated.
    DecodeFailed,
}

/// Next state for `event` in `state`.
///
/// Events that make no sense in a state leave it unchanged; in particular
/// a resolved session ignores everything.
pub fn transition(state: SessionState, event: SessionEvent) -> SessionState {
    use Outcome::*;
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Idle, E::Start) => S::Connecting,

        (S::Connecting, E::Connected) => S::AwaitingResponse,
        (S::Connecting, E::ConnectFailed | E::DeadlineElapsed) => S::Resolved(ConnectError),

        (S::AwaitingResponse, E::Chunk { complete: false }) => S::AwaitingResponse,
        (S::AwaitingResponse, E::Chunk { complete: true }) => S::Decoding,
        (S::AwaitingResponse, E::RemoteClosed | E::Acknowledged) => S::Decoding,
        (S::AwaitingResponse, E::WriteFailed) => S::Resolved(WriteError),
        (S::AwaitingResponse, E::SocketFailed) => S::Resolved(ConnectError),
        (S::AwaitingResponse, E::DeadlineElapsed) => S::Resolved(TimeoutError),

        (S::Decoding, E::Decoded) => S::Resolved(Success),
        (S::Decoding, E::ParseFailed) => S::Resolved(ParseError),
        (S::Decoding, E::DecodeFailed) => S::Resolved(DecodeError),

        (state, _) => state,
    }
}

// =============================================================================
// Driver
// =============================================================================

/// What the exchange should wait for after writing.
enum Reply<C> {
    Until(C),
    None,
}

/// Drives one request against one endpoint.
///
/// A session is single-use: every measure/configure method consumes it.
/// Sessions share nothing, so any number may run concurrently.
pub struct InstrumentSession<K: Connector = TcpConnector> {
    connector: K,
    endpoint: InstrumentEndpoint,
    state: SessionState,
}

impl InstrumentSession<TcpConnector> {
    /// Session over plain TCP.
    pub fn new(endpoint: InstrumentEndpoint) -> Self {
        Self::with_connector(TcpConnector, endpoint)
    }
}

impl<K: Connector> InstrumentSession<K> {
    /// Session using a custom connector.
    pub fn with_connector(connector: K, endpoint: InstrumentEndpoint) -> Self {
        Self {
            connector,
            endpoint,
            state: SessionState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &InstrumentEndpoint {
        &self.endpoint
    }

    /// Run a capture program and decode the waveform it returns.
    pub async fn measure_waveform<S: AsRef<str>>(
        mut self,
        commands: &[S],
    ) -> MeasureResult<DecodedWaveform> {
        let span = tracing::info_span!(
            "session",
            kind = "waveform",
            host = %self.endpoint.host,
            port = self.endpoint.port
        );
        async move {
            let payload = encode_commands(commands);
            let buffer = self
                .exchange(payload, Reply::Until(BinaryBlockCompletion::new()))
                .await?;

            let parsed = match parse(&buffer) {
                Ok(parsed) => parsed,
                Err(source) => {
                    return Err(self.fail(
                        SessionEvent::ParseFailed,
                        MeasureError::Parse {
                            source,
                            excerpt: excerpt(&buffer),
                        },
                    ))
                }
            };
            match decode_response(&parsed) {
                Ok(waveform) => {
                    self.advance(SessionEvent::Decoded);
                    tracing::info!(
                        samples = waveform.sample_count(),
                        vpp = waveform.peak_to_peak_voltage,
                        freq_hz = waveform.frequency_hz,
                        "Waveform captured"
                    );
                    Ok(waveform)
                }
                Err(source) => Err(self.fail(
                    SessionEvent::DecodeFailed,
                    MeasureError::Decode {
                        source,
                        excerpt: excerpt(&buffer),
                    },
                )),
            }
        }
        .instrument(span)
        .await
    }

    /// Send a query and return the first reply, sanitized.
    pub async fn measure_reading(mut self, command: &str) -> MeasureResult<String> {
        let span = tracing::info_span!(
            "session",
            kind = "reading",
            host = %self.endpoint.host,
            port = self.endpoint.port
        );
        async move {
            let buffer = self
                .exchange(encode_commands(&[command]), Reply::Until(FirstChunkCompletion))
                .await?;

            if buffer.is_empty() {
                return Err(self.fail(
                    SessionEvent::ParseFailed,
                    MeasureError::Parse {
                        source: crate::error::ParseError::Empty,
                        excerpt: String::new(),
                    },
                ));
            }

            let reading = sanitize_reading(&buffer);
            self.advance(SessionEvent::Decoded);
            tracing::info!(reading = %reading, "Reading received");
            Ok(reading)
        }
        .instrument(span)
        .await
    }

    /// Write a configuration command; success means a clean write.
    pub async fn configure(mut self, command: &str) -> MeasureResult<()> {
        let span = tracing::info_span!(
            "session",
            kind = "configure",
            host = %self.endpoint.host,
            port = self.endpoint.port
        );
        async move {
            self.exchange(encode_commands(&[command]), Reply::<FirstChunkCompletion>::None)
                .await?;
            self.advance(SessionEvent::Decoded);
            tracing::info!(command, "Configuration written");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Connect, write, collect the reply, close.
    ///
    /// Returns the accumulated bytes with the session in `Decoding`, or the
    /// terminal error with the session resolved.
    async fn exchange<C: Completion>(
        &mut self,
        payload: Bytes,
        reply: Reply<C>,
    ) -> MeasureResult<Bytes> {
        let deadline = Instant::now() + self.endpoint.timeout();
        self.advance(SessionEvent::Start);

        let opened = timeout_at(deadline, self.connector.open(&self.endpoint)).await;
        let mut channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => return Err(self.fail(SessionEvent::ConnectFailed, err)),
            Err(_) => {
                let err = MeasureError::Connect {
                    address: self.endpoint.address(),
                    reason: ConnectFailure::Timeout,
                };
                return Err(self.fail(SessionEvent::DeadlineElapsed, err));
            }
        };
        self.advance(SessionEvent::Connected);

        let received = timeout_at(deadline, self.collect(&mut channel, &payload, reply)).await;
        channel.close().await;

        match received {
            Ok(Ok(buffer)) => Ok(buffer),
            Ok(Err((event, err))) => Err(self.fail(event, err)),
            Err(_) => {
                let err = MeasureError::Timeout {
                    address: self.endpoint.address(),
                    timeout_ms: self.endpoint.timeout_ms,
                };
                Err(self.fail(SessionEvent::DeadlineElapsed, err))
            }
        }
    }

    /// Write the payload and read until the reply is complete.
    ///
    /// Failures come back with the event that resolves them, so the caller
    /// can close the channel before the state machine resolves.
    async fn collect<C: Completion>(
        &mut self,
        channel: &mut K::Channel,
        payload: &[u8],
        reply: Reply<C>,
    ) -> Result<Bytes, (SessionEvent, MeasureError)> {
        channel
            .write(payload)
            .await
            .map_err(|err| (SessionEvent::WriteFailed, err))?;

        let completion = match reply {
            Reply::Until(completion) => completion,
            Reply::None => {
                self.advance(SessionEvent::Acknowledged);
                return Ok(Bytes::new());
            }
        };

        let mut accumulator = FrameAccumulator::new(completion);
        loop {
            match channel.read_chunk().await {
                Ok(Some(chunk)) => {
                    let complete = accumulator.append(&chunk);
                    tracing::trace!(
                        chunk = chunk.len(),
                        total = accumulator.len(),
                        expected = ?accumulator.expected_len(),
                        "Chunk received"
                    );
                    if self.advance(SessionEvent::Chunk { complete }) == SessionState::Decoding {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(
                        buffered = accumulator.len(),
                        "Remote closed before reply was complete"
                    );
                    self.advance(SessionEvent::RemoteClosed);
                    break;
                }
                Err(err) => return Err((SessionEvent::SocketFailed, err)),
            }
        }

        tracing::debug!(
            bytes = accumulator.len(),
            chunks = accumulator.chunk_count(),
            "Reply collected"
        );
        Ok(accumulator.into_bytes())
    }

    fn advance(&mut self, event: SessionEvent) -> SessionState {
        let next = transition(self.state, event);
        if next != self.state {
            tracing::debug!("{} -> {} on {:?}", self.state, next, event);
        }
        self.state = next;
        next
    }

    fn fail(&mut self, event: SessionEvent, err: MeasureError) -> MeasureError {
        self.advance(event);
        tracing::warn!(kind = err.kind(), "Measurement failed: {}", err);
        err
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Capture and decode one oscilloscope waveform over TCP.
pub async fn measure_waveform<S: AsRef<str>>(
    endpoint: &InstrumentEndpoint,
    commands: &[S],
) -> MeasureResult<DecodedWaveform> {
    InstrumentSession::new(endpoint.clone())
        .measure_waveform(commands)
        .await
}

/// Query one multimeter reading over TCP.
pub async fn measure_reading(endpoint: &InstrumentEndpoint, command: &str) -> MeasureResult<String> {
    InstrumentSession::new(endpoint.clone())
        .measure_reading(command)
        .await
}

/// Send one multimeter configuration command over TCP.
pub async fn configure(endpoint: &InstrumentEndpoint, command: &str) -> MeasureResult<()> {
    InstrumentSession::new(endpoint.clone()).configure(command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scpi::encode_binary_block;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing_test::traced_test;

    // ---------------------------------------------------------------------
    // Transition table
    // ---------------------------------------------------------------------

    #[test]
    fn happy_path_transitions() {
        let mut state = SessionState::Idle;
        for event in [
            SessionEvent::Start,
            SessionEvent::Connected,
            SessionEvent::Chunk { complete: false },
            SessionEvent::Chunk { complete: true },
            SessionEvent::Decoded,
        ] {
            state = transition(state, event);
        }
        assert_eq!(state, SessionState::Resolved(Outcome::Success));
    }

    #[test]
    fn deadline_maps_to_phase() {
        assert_eq!(
            transition(SessionState::Connecting, SessionEvent::DeadlineElapsed),
            SessionState::Resolved(Outcome::ConnectError)
        );
        assert_eq!(
            transition(SessionState::AwaitingResponse, SessionEvent::DeadlineElapsed),
            SessionState::Resolved(Outcome::TimeoutError)
        );
    }

    #[test]
    fn remote_close_goes_to_best_effort_decode() {
        assert_eq!(
            transition(SessionState::AwaitingResponse, SessionEvent::RemoteClosed),
            SessionState::Decoding
        );
        assert_eq!(
            transition(SessionState::Decoding, SessionEvent::ParseFailed),
            SessionState::Resolved(Outcome::ParseError)
        );
    }

    #[test]
    fn resolved_states_absorb_events() {
        let resolved = SessionState::Resolved(Outcome::TimeoutError);
        for event in [
            SessionEvent::Start,
            SessionEvent::Chunk { complete: true },
            SessionEvent::Decoded,
            SessionEvent::DeadlineElapsed,
        ] {
            assert_eq!(transition(resolved, event), resolved);
        }
    }

    #[test]
    fn out_of_order_events_are_ignored() {
        assert_eq!(
            transition(SessionState::Idle, SessionEvent::Decoded),
            SessionState::Idle
        );
        assert_eq!(
            transition(SessionState::Decoding, SessionEvent::Chunk { complete: false }),
            SessionState::Decoding
        );
    }

    // ---------------------------------------------------------------------
    // Scripted channel
    // ---------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Script {
        chunks: Arc<Mutex<VecDeque<Bytes>>>,
        written: Arc<Mutex<Vec<u8>>>,
        closes: Arc<AtomicUsize>,
        hang_after_chunks: bool,
        fail_write: bool,
        refuse: bool,
        hang_open: bool,
    }

    impl Script {
        fn replying(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: Arc::new(Mutex::new(
                    chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect(),
                )),
                ..Default::default()
            }
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct ScriptedChannel(Script);

    #[async_trait]
    impl Channel for ScriptedChannel {
        async fn write(&mut self, bytes: &[u8]) -> MeasureResult<()> {
            if self.0.fail_write {
                return Err(MeasureError::Write {
                    address: "script".into(),
                    source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                });
            }
            self.0.written.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        async fn read_chunk(&mut self) -> MeasureResult<Option<Bytes>> {
            let next = self.0.chunks.lock().unwrap().pop_front();
            match next {
                Some(chunk) => Ok(Some(chunk)),
                None if self.0.hang_after_chunks => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for Script {
        type Channel = ScriptedChannel;

        async fn open(&self, endpoint: &InstrumentEndpoint) -> MeasureResult<ScriptedChannel> {
            if self.hang_open {
                std::future::pending::<()>().await;
            }
            if self.refuse {
                return Err(MeasureError::Connect {
                    address: endpoint.address(),
                    reason: ConnectFailure::Refused,
                });
            }
            Ok(ScriptedChannel(self.clone()))
        }
    }

    fn endpoint(timeout_ms: u64) -> InstrumentEndpoint {
        InstrumentEndpoint::new("192.168.0.200", 5555, timeout_ms)
    }

    fn scope_reply() -> Vec<u8> {
        let mut reply = b"1.0\n2.5\n1000.0\n0,0,0,0,0.001,0,0,0.04,0,128\n".to_vec();
        reply.extend(encode_binary_block(&[118; 20]));
        reply.push(b'\n');
        reply
    }

    #[tokio::test]
    async fn decodes_chunked_waveform() {
        let reply = scope_reply();
        let (a, b) = reply.split_at(47);
        let script = Script::replying(&[a, b]);
        let session = InstrumentSession::with_connector(script.clone(), endpoint(1000));

        let waveform = session.measure_waveform(&[":WAV:DATA?"]).await.unwrap();

        assert_eq!(waveform.sample_count(), 20);
        assert!((waveform.samples[0] + 0.4).abs() < 1e-9);
        assert_eq!(script.written.lock().unwrap().as_slice(), b":WAV:DATA?\n");
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test]
    async fn stops_reading_once_complete() {
        let reply = scope_reply();
        let script = Script::replying(&[&reply, b"never read"]);
        let session = InstrumentSession::with_connector(script.clone(), endpoint(1000));

        session.measure_waveform(&[":WAV:DATA?"]).await.unwrap();
        assert_eq!(script.chunks.lock().unwrap().len(), 1);
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test]
    async fn truncated_reply_is_decoded_on_close() {
        let reply = scope_reply();
        let script = Script::replying(&[&reply[..reply.len() - 6]]);
        let session = InstrumentSession::with_connector(script.clone(), endpoint(1000));

        let waveform = session.measure_waveform(&[":WAV:DATA?"]).await.unwrap();
        assert_eq!(waveform.sample_count(), 15);
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_instrument_times_out() {
        let script = Script {
            hang_after_chunks: true,
            ..Script::replying(&[b"1.0\n"])
        };
        let session = InstrumentSession::with_connector(script.clone(), endpoint(100));

        let err = session.measure_waveform(&[":WAV:DATA?"]).await.unwrap_err();
        assert!(matches!(err, MeasureError::Timeout { timeout_ms: 100, .. }));
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_deadline_is_a_connect_error() {
        let script = Script {
            hang_open: true,
            ..Default::default()
        };
        let mut session = InstrumentSession::with_connector(script.clone(), endpoint(250));

        let started = Instant::now();
        let err = session
            .exchange(Bytes::from_static(b"*IDN?\n"), Reply::Until(FirstChunkCompletion))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MeasureError::Connect {
                reason: ConnectFailure::Timeout,
                ..
            }
        ));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
        assert_eq!(session.state(), SessionState::Resolved(Outcome::ConnectError));
        assert_eq!(script.closes(), 0);
        assert!(script.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_connect_never_opens_channel() {
        let script = Script {
            refuse: true,
            ..Default::default()
        };
        let session = InstrumentSession::with_connector(script.clone(), endpoint(1000));
        let err = session.measure_reading("MEAS:VOLT:DC?").await.unwrap_err();
        assert!(matches!(
            err,
            MeasureError::Connect {
                reason: ConnectFailure::Refused,
                ..
            }
        ));
        assert_eq!(script.closes(), 0);
    }

    #[tokio::test]
    async fn failed_write_still_closes() {
        let script = Script {
            fail_write: true,
            ..Default::default()
        };
        let session = InstrumentSession::with_connector(script.clone(), endpoint(1000));
        let err = session.configure("CONF:VOLT:DC").await.unwrap_err();
        assert_eq!(err.kind(), "write");
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test]
    async fn reading_takes_first_chunk() {
        let script = Script::replying(&[b"+4.99870E+00\r\n", b"+5.00000E+00\r\n"]);
        let session = InstrumentSession::with_connector(script.clone(), endpoint(1000));
        let reading = session.measure_reading("MEAS:VOLT:DC?").await.unwrap();
        assert_eq!(reading, "+4.99870E+00");
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test]
    async fn empty_reading_is_a_parse_error() {
        let script = Script::replying(&[]);
        let session = InstrumentSession::with_connector(script.clone(), endpoint(1000));
        let err = session.measure_reading("MEAS:VOLT:DC?").await.unwrap_err();
        assert_eq!(err.parse_error(), Some(&crate::error::ParseError::Empty));
        assert_eq!(script.closes(), 1);
    }

    #[traced_test]
    #[tokio::test]
    async fn terminal_errors_are_logged() {
        let script = Script::replying(&[b"no marker here\n"]);
        let session = InstrumentSession::with_connector(script, endpoint(1000));
        session.measure_waveform(&[":WAV:DATA?"]).await.unwrap_err();

        assert!(logs_contain("Measurement failed"));
        assert!(logs_contain("malformed response"));
        assert!(logs_contain("Decoding -> Resolved(ParseError)"));
    }

    #[tokio::test]
    async fn configure_does_not_wait_for_reply() {
        let script = Script {
            hang_after_chunks: true,
            ..Default::default()
        };
        let session = InstrumentSession::with_connector(script.clone(), endpoint(50));
        tokio::time::timeout(Duration::from_secs(1), session.configure("CONF:RES"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(script.written.lock().unwrap().as_slice(), b"CONF:RES\n");
        assert_eq!(script.closes(), 1);
    }
}
