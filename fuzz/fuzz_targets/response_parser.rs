//! Fuzz target for reply parsing and waveform decoding.
//!
//! Tests:
//! - No panics on arbitrary replies
//! - Parsed sample slices stay inside the buffer
//! - Decoding yields one voltage per sample byte

#![no_main]

use board_daq::parser::parse;
use board_daq::waveform::decode_response;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = board_daq::parser::excerpt(data);

    let Ok(parsed) = parse(data) else {
        return;
    };
    let after_digit = parsed.header.binary_marker_offset + 2;
    assert!(after_digit <= data.len());
    assert!(parsed.samples.len() <= data.len() - after_digit);

    if let Ok(waveform) = decode_response(&parsed) {
        assert_eq!(waveform.sample_count(), parsed.samples.len());
        let _ = waveform.normalized_samples();
    }
});
