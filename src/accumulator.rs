//! Reassembly of instrument replies from a TCP byte stream.
//!
//! TCP has no message boundaries. A capture reply may arrive in dozens of
//! chunks, and a chunk boundary can fall anywhere, including inside the
//! `#N<len>` framing. [`FrameAccumulator`] appends every chunk to a single
//! growing `BytesMut` and asks a [`Completion`] predicate whether the reply
//! is whole yet.
//!
//! Two predicates exist, one per session variant:
//!
//! - [`BinaryBlockCompletion`]: oscilloscope captures. Complete once the
//!   definite-length block announced after `#` has fully arrived.
//! - [`FirstChunkCompletion`]: multimeter readings. Complete on the first
//!   non-empty chunk.
//!
//! Predicates never fail. A reply that never completes is ended by the
//! session deadline, or parsed as-is when the remote closes.

use bytes::{Bytes, BytesMut};

use crate::parser::{
    ascii_digit, count_header_lines, find_marker, leading_decimal, HEADER_LINE_COUNT,
};

/// Buffer length a binary reply must exceed before completeness is checked.
pub const MIN_CHECK_LEN: usize = 50;

/// Initial buffer capacity; large enough for the header of a capture.
pub const INITIAL_CAPACITY: usize = 4 * 1024;

/// Upper bound on capacity reserved ahead from an announced block length.
pub const MAX_RESERVE: usize = 16 * 1024 * 1024;

/// Decides whether an accumulated buffer holds a whole reply.
pub trait Completion: Send {
    /// Inspect the buffer after an append.
    ///
    /// The buffer only ever grows between calls, so implementations may
    /// cache what they learned from earlier calls.
    fn check(&mut self, buffer: &[u8]) -> bool;

    /// Total reply length, once it is known.
    fn expected_len(&self) -> Option<usize> {
        None
    }
}

// =============================================================================
// Binary block predicate
// =============================================================================

/// Where the first `#` sits and what it announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerScan {
    /// No `#` in `buffer[..scanned]`.
    Searching { scanned: usize },
    /// First `#` found but fewer than four header lines precede it.
    /// The prefix can no longer change, so this never completes.
    ShortHeader,
    /// `#` found with a valid header; waiting for framing digits.
    Found { hash_index: usize },
    /// `#N` is not followed by a usable length. Never completes.
    Unframed,
    /// Framing fully read.
    Framed { total_len: usize },
}

/// Completion for `#N<len><bytes>` definite-length blocks.
///
/// The marker position is cached once found, so each check after that is
/// constant time instead of rescanning the whole buffer.
#[derive(Debug, Clone)]
pub struct BinaryBlockCompletion {
    scan: MarkerScan,
}

impl Default for BinaryBlockCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryBlockCompletion {
    /// Fresh predicate for one reply.
    pub fn new() -> Self {
        Self {
            scan: MarkerScan::Searching { scanned: 0 },
        }
    }

    fn advance(&mut self, buffer: &[u8]) {
        loop {
            match self.scan {
                MarkerScan::Searching { scanned } => match find_marker(&buffer[scanned..]) {
                    Some(offset) => {
                        let hash_index = scanned + offset;
                        let lines = count_header_lines(&buffer[..hash_index]);
                        self.scan = if lines >= HEADER_LINE_COUNT {
                            MarkerScan::Found { hash_index }
                        } else {
                            MarkerScan::ShortHeader
                        };
                    }
                    None => {
                        self.scan = MarkerScan::Searching {
                            scanned: buffer.len(),
                        };
                        return;
                    }
                },
                MarkerScan::Found { hash_index } => {
                    let Some(&digit) = buffer.get(hash_index + 1) else {
                        return;
                    };
                    let Some(digit_count) = ascii_digit(digit) else {
                        self.scan = MarkerScan::Unframed;
                        return;
                    };
                    let length_start = hash_index + 2;
                    let data_start = length_start + digit_count;
                    if buffer.len() < data_start {
                        return;
                    }
                    let length_digits = &buffer[length_start..data_start];
                    self.scan = match leading_decimal(length_digits) {
                        Some(declared) if length_digits.iter().all(u8::is_ascii_digit) => {
                            MarkerScan::Framed {
                                total_len: data_start.saturating_add(declared),
                            }
                        }
                        _ => MarkerScan::Unframed,
                    };
                }
                MarkerScan::ShortHeader | MarkerScan::Unframed | MarkerScan::Framed { .. } => {
                    return
                }
            }
        }
    }
}

impl Completion for BinaryBlockCompletion {
    fn check(&mut self, buffer: &[u8]) -> bool {
        if buffer.len() <= MIN_CHECK_LEN {
            return false;
        }
        self.advance(buffer);
        match self.scan {
            MarkerScan::Framed { total_len } => buffer.len() >= total_len,
            _ => false,
        }
    }

    fn expected_len(&self) -> Option<usize> {
        match self.scan {
            MarkerScan::Framed { total_len } => Some(total_len),
            _ => None,
        }
    }
}

// =============================================================================
// First chunk predicate
// =============================================================================

/// Completion for single-line ASCII replies: any byte at all wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstChunkCompletion;

impl Completion for FirstChunkCompletion {
    fn check(&mut self, buffer: &[u8]) -> bool {
        !buffer.is_empty()
    }
}

// =============================================================================
// Accumulator
// =============================================================================

/// Append-only reply buffer paired with a completeness predicate.
///
/// Bytes are kept strictly in arrival order. Once complete, the
/// accumulator stays complete no matter what is appended afterwards.
#[derive(Debug)]
pub struct FrameAccumulator<C> {
    buffer: BytesMut,
    completion: C,
    complete: bool,
    chunks: usize,
}

impl<C: Completion> FrameAccumulator<C> {
    /// Empty accumulator using `completion`.
    pub fn new(completion: C) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            completion,
            complete: false,
            chunks: 0,
        }
    }

    /// Append one inbound chunk and re-evaluate completeness.
    ///
    /// Returns whether the reply is now complete.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        self.chunks += 1;
        self.buffer.extend_from_slice(chunk);
        if !self.complete {
            self.complete = self.completion.check(&self.buffer);
            if let Some(expected) = self.completion.expected_len() {
                // Grow once to the full frame rather than per chunk.
                let missing = expected.saturating_sub(self.buffer.len()).min(MAX_RESERVE);
                self.buffer.reserve(missing);
            }
        }
        self.complete
    }

    /// Whether a whole reply has arrived.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True before the first non-empty chunk.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of `append` calls so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Total reply length, once the framing announced it.
    pub fn expected_len(&self) -> Option<usize> {
        self.completion.expected_len()
    }

    /// View of the accumulated bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the accumulator, keeping the bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &[u8] = b"1.0\n2.5\n1000.0\n0,0,0,0,0.001,0,0,0.04,0,128\n";

    fn capture_reply(samples: &[u8]) -> Vec<u8> {
        capture_reply_with(HEADER, samples)
    }

    fn capture_reply_with(header: &[u8], samples: &[u8]) -> Vec<u8> {
        let mut buf = header.to_vec();
        let len = samples.len().to_string();
        buf.push(b'#');
        buf.extend_from_slice(len.len().to_string().as_bytes());
        buf.extend_from_slice(len.as_bytes());
        buf.extend_from_slice(samples);
        buf
    }

    #[test]
    fn completes_only_when_block_is_whole() {
        let reply = capture_reply(&[118; 20]);
        let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());

        assert!(!acc.append(&reply[..reply.len() - 1]));
        assert_eq!(acc.expected_len(), Some(reply.len()));
        assert!(acc.append(&reply[reply.len() - 1..]));
        assert_eq!(acc.as_bytes(), reply.as_slice());
    }

    #[test]
    fn completes_regardless_of_chunking() {
        let reply = capture_reply(&(0..=255).collect::<Vec<u8>>());
        for chunk_size in [1, 2, 3, 7, 50, 64, 1000] {
            let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());
            let chunks: Vec<&[u8]> = reply.chunks(chunk_size).collect();
            let (last, head) = chunks.split_last().unwrap();
            for chunk in head {
                assert!(!acc.append(chunk), "early completion at size {chunk_size}");
            }
            assert!(acc.append(last), "no completion at size {chunk_size}");
            assert_eq!(acc.len(), reply.len());
            assert_eq!(acc.chunk_count(), chunks.len());
        }
    }

    #[test]
    fn stays_complete_after_more_bytes() {
        let reply = capture_reply(&[1; 20]);
        assert!(reply.len() > MIN_CHECK_LEN);
        let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());
        assert!(acc.append(&reply));
        assert!(acc.append(b"\n"));
        assert!(acc.append(b"#garbage"));
        assert!(acc.is_complete());
    }

    #[test]
    fn ignores_short_buffers() {
        // A structurally complete but tiny reply waits for more data.
        let reply = b"1\n2\n3\n4,5,6,7,8,9,10,11,12,13\n#11x";
        assert!(reply.len() <= MIN_CHECK_LEN);
        let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());
        assert!(!acc.append(reply));
    }

    #[test]
    fn marker_with_short_header_never_completes() {
        let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());
        acc.append(b"1.0\n2.5\n1000.0\n#15");
        acc.append(&[b'x'; 100]);
        assert!(!acc.is_complete());
    }

    #[test]
    fn non_digit_count_is_not_an_error() {
        let mut reply = HEADER.to_vec();
        reply.extend_from_slice(b"#Z");
        reply.extend_from_slice(&[0; 64]);
        let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());
        assert!(!acc.append(&reply));
        assert_eq!(acc.expected_len(), None);
    }

    #[test]
    fn waits_for_length_digits() {
        let header: &[u8] =
            b"1.000000e+00\n2.500000e+00\n1.000000e+03\n0,0,0,0,1.0e-03,0,0,4.0e-02,0,128\n";
        let reply = capture_reply_with(header, &[9; 1500]);
        let split = header.len() + 3; // "#41" arrived, "500" pending
        let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());
        assert!(!acc.append(&reply[..split]));
        assert_eq!(acc.expected_len(), None);
        assert!(!acc.append(&reply[split..split + 3]));
        assert_eq!(acc.expected_len(), Some(reply.len()));
        assert!(acc.append(&reply[split + 3..]));
    }

    #[test]
    fn blank_unicode_line_does_not_count_as_header() {
        // A line holding only a vertical tab is blank.
        let header: &[u8] = b"1.0\n2.5\n\x0b\n0,0,0,0,0.001,0,0,0.04,0,128\n";
        let reply = capture_reply_with(header, &[118; 20]);
        let mut acc = FrameAccumulator::new(BinaryBlockCompletion::new());
        assert!(!acc.append(&reply));
        assert!(matches!(
            crate::parser::parse(&reply),
            Err(crate::error::ParseError::InsufficientHeaderLines { got: 3 })
        ));
    }

    #[test]
    fn first_chunk_wins() {
        let mut acc = FrameAccumulator::new(FirstChunkCompletion);
        assert!(!acc.append(b""));
        assert!(acc.is_empty());
        assert!(acc.append(b"+1.2345E+00"));
        assert_eq!(acc.into_bytes().as_ref(), b"+1.2345E+00");
    }
}
