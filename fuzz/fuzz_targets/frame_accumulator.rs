//! Fuzz target for reply reassembly.
//!
//! Tests:
//! - Arbitrary reply bytes split at arbitrary boundaries
//! - Completeness never reverts once reached
//! - The final verdict does not depend on how the reply was chunked

#![no_main]

use arbitrary::Arbitrary;
use board_daq::accumulator::{BinaryBlockCompletion, FrameAccumulator};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct ChunkedReply {
    /// Reply bytes
    data: Vec<u8>,
    /// Chunk lengths, cycled until `data` is used up
    splits: Vec<u8>,
}

fuzz_target!(|input: ChunkedReply| {
    let mut whole = FrameAccumulator::new(BinaryBlockCompletion::new());
    let expected = whole.append(&input.data);

    let mut chunked = FrameAccumulator::new(BinaryBlockCompletion::new());
    let mut rest = input.data.as_slice();
    let mut splits = input.splits.iter().map(|&s| usize::from(s).max(1)).cycle();
    let mut was_complete = false;

    while !rest.is_empty() {
        let take = splits.next().unwrap_or(rest.len()).min(rest.len());
        let (chunk, tail) = rest.split_at(take);
        let complete = chunked.append(chunk);
        assert!(!was_complete || complete, "completeness reverted");
        was_complete = complete;
        rest = tail;
    }

    assert_eq!(chunked.len(), input.data.len());
    assert_eq!(chunked.as_bytes(), input.data.as_slice());
    if !input.data.is_empty() {
        assert_eq!(chunked.is_complete(), expected, "verdict depends on chunking");
    }
});
