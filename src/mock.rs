//! Scripted TCP instrument for tests and demos.
//!
//! [`MockInstrument`] listens on a loopback port and answers every
//! connection with a [`MockBehavior`]. It records all bytes it receives,
//! so tests can check exactly what a session wrote.
//!
//! ```no_run
//! use board_daq::mock::{MockBehavior, MockInstrument, ScopeReply};
//! use board_daq::scpi::{scope_capture_sequence, ScopeChannel};
//! use board_daq::session::measure_waveform;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let scope = MockInstrument::start(MockBehavior::scope(&ScopeReply::default())).await?;
//! let commands = scope_capture_sequence(ScopeChannel::default());
//! let waveform = measure_waveform(&scope.endpoint(1_000), &commands).await?;
//! assert_eq!(waveform.sample_count(), 20);
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::scpi::{encode_binary_block, WAVEFORM_COMMAND_COUNT};
use crate::transport::InstrumentEndpoint;

/// A scripted reply.
#[derive(Debug, Clone)]
pub struct ReplyScript {
    /// Number of `\n`-terminated commands to read before replying.
    pub after_lines: usize,
    /// Reply bytes, written one chunk at a time.
    pub chunks: Vec<Bytes>,
    /// Pause before each chunk.
    pub delay: Duration,
    /// Close the connection after the last chunk.
    pub close_after: bool,
}

impl ReplyScript {
    /// Reply with `payload` in one chunk after the first command.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            after_lines: 1,
            chunks: vec![payload.into()],
            delay: Duration::ZERO,
            close_after: false,
        }
    }

    /// Re-split the reply into chunks of at most `size` bytes.
    pub fn chunked(mut self, size: usize) -> Self {
        let size = size.max(1);
        let joined: Vec<u8> = self.chunks.iter().flat_map(|c| c.iter().copied()).collect();
        self.chunks = joined
            .chunks(size)
            .map(Bytes::copy_from_slice)
            .collect();
        self
    }

    /// Pause `delay` before each chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Wait for `lines` commands before replying.
    pub fn after_lines(mut self, lines: usize) -> Self {
        self.after_lines = lines;
        self
    }

    /// Close the connection once the reply is written.
    pub fn then_close(mut self) -> Self {
        self.close_after = true;
        self
    }
}

/// How the mock answers a connection.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Send a scripted reply.
    Reply(ReplyScript),
    /// Read and record, never answer.
    Silent,
    /// Accept, then close straight away.
    CloseImmediately,
}

impl MockBehavior {
    /// Oscilloscope answering a full capture program with `reply`.
    pub fn scope(reply: &ScopeReply) -> Self {
        MockBehavior::Reply(ReplyScript::new(reply.to_bytes()).after_lines(WAVEFORM_COMMAND_COUNT))
    }

    /// Multimeter answering any query with `reading` plus CRLF.
    pub fn meter(reading: &str) -> Self {
        MockBehavior::Reply(ReplyScript::new(format!("{reading}\r\n")))
    }
}

/// Contents of a synthetic oscilloscope reply.
///
/// The default is a 1 V/div, 2.5 Vpp, 1 kHz capture of 20 samples
/// sampled every millisecond.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeReply {
    /// Vertical scale line.
    pub voltage_scale: String,
    /// Peak-to-peak line.
    pub peak_to_peak: String,
    /// Frequency line.
    pub frequency: String,
    /// Comma-separated preamble line.
    pub preamble: String,
    /// Raw sample bytes.
    pub samples: Vec<u8>,
    /// Append `\n` after the block, as real instruments do.
    pub trailing_newline: bool,
}

impl Default for ScopeReply {
    fn default() -> Self {
        let mut samples = vec![118; 10];
        samples.extend_from_slice(&[138; 10]);
        Self {
            voltage_scale: "1.0".into(),
            peak_to_peak: "2.5".into(),
            frequency: "1000.0".into(),
            preamble: "0,0,0,0,0.001,0,0,0.04,0,128".into(),
            samples,
            trailing_newline: false,
        }
    }
}

impl ScopeReply {
    /// Wire bytes: four header lines then the binary block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut reply = format!(
            "{}\n{}\n{}\n{}\n",
            self.voltage_scale, self.peak_to_peak, self.frequency, self.preamble
        )
        .into_bytes();
        reply.extend(encode_binary_block(&self.samples));
        if self.trailing_newline {
            reply.push(b'\n');
        }
        reply
    }
}

// =============================================================================
// Server
// =============================================================================

#[derive(Default)]
struct Shared {
    received: Mutex<Vec<u8>>,
    connections: AtomicUsize,
    notify: Notify,
}

/// A loopback TCP server with scripted behavior.
///
/// The accept loop is aborted on drop.
pub struct MockInstrument {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl MockInstrument {
    /// Bind to an ephemeral loopback port and start serving.
    pub async fn start(behavior: MockBehavior) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());

        let task = tokio::spawn(serve(listener, behavior, Arc::clone(&shared)));
        tracing::debug!("Mock instrument listening on {}", addr);

        Ok(Self { addr, shared, task })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint pointing at this mock.
    pub fn endpoint(&self, timeout_ms: u64) -> InstrumentEndpoint {
        InstrumentEndpoint::new(self.addr.ip().to_string(), self.addr.port(), timeout_ms)
    }

    /// Everything received so far, across connections.
    pub async fn received(&self) -> Vec<u8> {
        self.shared.received.lock().await.clone()
    }

    /// Received bytes split into commands.
    pub async fn received_commands(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.received().await)
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `lines` commands arrived, or `within` elapses.
    pub async fn wait_for_lines(&self, lines: usize, within: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.notify.notified();
                if count_lines(&self.shared.received.lock().await) >= lines {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(within, wait).await.is_ok()
    }
}

impl Drop for MockInstrument {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn count_lines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == b'\n').count()
}

async fn serve(listener: TcpListener, behavior: MockBehavior, shared: Arc<Shared>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("Mock instrument accept failed: {}", err);
                return;
            }
        };
        shared.connections.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Mock instrument accepted {}", peer);

        let behavior = behavior.clone();
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(err) = handle(socket, behavior, &shared).await {
                tracing::debug!("Mock connection from {} ended: {}", peer, err);
            }
        });
    }
}

async fn handle(mut socket: TcpStream, behavior: MockBehavior, shared: &Shared) -> io::Result<()> {
    match behavior {
        MockBehavior::CloseImmediately => socket.shutdown().await,
        MockBehavior::Silent => drain(&mut socket, shared, usize::MAX).await.map(|_| ()),
        MockBehavior::Reply(script) => {
            let lines = drain(&mut socket, shared, script.after_lines).await?;
            if lines < script.after_lines {
                return Ok(());
            }
            for chunk in &script.chunks {
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                socket.write_all(chunk).await?;
                socket.flush().await?;
            }
            if script.close_after {
                return socket.shutdown().await;
            }
            drain(&mut socket, shared, usize::MAX).await.map(|_| ())
        }
    }
}

/// Record inbound bytes until `lines` newlines arrived on this connection
/// or the peer closed. Returns the newlines seen.
async fn drain(socket: &mut TcpStream, shared: &Shared, lines: usize) -> io::Result<usize> {
    let mut seen = 0;
    let mut buf = [0u8; 1024];
    while seen < lines {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        seen += count_lines(&buf[..n]);
        shared.received.lock().await.extend_from_slice(&buf[..n]);
        shared.notify.notify_waiters();
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_reply_layout() {
        let bytes = ScopeReply::default().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("1.0\n2.5\n1000.0\n0,0,0,0,0.001,0,0,0.04,0,128\n#220"));
        assert_eq!(bytes.len(), 44 + 4 + 20);
        assert_eq!(*bytes.last().unwrap(), 138);
    }

    #[test]
    fn chunked_preserves_bytes() {
        let script = ReplyScript::new(&b"abcdefg"[..]).chunked(3);
        let sizes: Vec<_> = script.chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn records_what_it_receives() {
        let mock = MockInstrument::start(MockBehavior::Silent).await.unwrap();
        let mut socket = TcpStream::connect(mock.addr()).await.unwrap();
        socket.write_all(b"*IDN?\n*RST\n").await.unwrap();

        assert!(mock.wait_for_lines(2, Duration::from_secs(1)).await);
        assert_eq!(mock.received_commands().await, vec!["*IDN?", "*RST"]);
        assert_eq!(mock.connection_count(), 1);
    }

    #[tokio::test]
    async fn replies_after_requested_lines() {
        let script = ReplyScript::new(&b"ok"[..]).after_lines(2).then_close();
        let mock = MockInstrument::start(MockBehavior::Reply(script)).await.unwrap();
        let mut socket = TcpStream::connect(mock.addr()).await.unwrap();

        socket.write_all(b"A\nB\n").await.unwrap();
        let mut reply = Vec::new();
        socket.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ok");
    }
}
