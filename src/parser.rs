//! Response parser for oscilloscope waveform replies.
//!
//! A capture reply is four ASCII lines followed by an IEEE 488.2 definite
//! length block:
//!
//! ```text
//! <v/div>\n<vpp>\n<freq>\n<preamble csv>\n#<N><N length digits><samples>[\n]
//! ```
//!
//! Parsing is pure. The same marker scanning is used by
//! [`BinaryBlockCompletion`](crate::accumulator::BinaryBlockCompletion) to
//! decide when a reply has fully arrived, so both agree on where the block
//! starts.

use crate::error::ParseError;

/// ASCII introducer of a binary block.
pub const BLOCK_MARKER: u8 = b'#';

/// Non-empty text lines required ahead of the binary block.
pub const HEADER_LINE_COUNT: usize = 4;

/// Minimum comma-separated fields in the waveform preamble.
pub const MIN_PREAMBLE_FIELDS: usize = 10;

/// Index of the preamble among the header lines.
pub const PREAMBLE_LINE: usize = 3;

/// Characters of raw buffer quoted in error messages.
pub const EXCERPT_CHARS: usize = 100;

/// Header section of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    /// Non-empty, trimmed text lines preceding the block, in order.
    pub text_lines: Vec<String>,
    /// Byte offset of `#` in the buffer.
    pub binary_marker_offset: usize,
    /// The single digit following `#`.
    pub digit_count: usize,
    /// Block length announced by the instrument (0 if unreadable).
    pub declared_byte_length: usize,
}

impl ParsedHeader {
    /// Header line by index, if present.
    pub fn line(&self, index: usize) -> Option<&str> {
        self.text_lines.get(index).map(String::as_str)
    }

    /// Comma-separated preamble fields.
    pub fn preamble_fields(&self) -> Vec<&str> {
        self.line(PREAMBLE_LINE)
            .map(|line| line.split(',').map(str::trim).collect())
            .unwrap_or_default()
    }

    /// Offset of the first sample byte.
    pub fn data_offset(&self) -> usize {
        self.binary_marker_offset + 2 + self.digit_count
    }
}

/// A reply split into header and raw sample bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse<'a> {
    /// Text header and block framing.
    pub header: ParsedHeader,
    /// Raw unsigned sample bytes, trailing terminator removed.
    pub samples: &'a [u8],
}

/// Split an accumulated reply into header lines and sample bytes.
///
/// Checks run in a fixed order: emptiness, marker, header line count,
/// digit count, preamble width. The sample range runs from just past the
/// length digits to the end of the buffer; a single `\n` in the very last
/// position is dropped as a terminator.
pub fn parse(buffer: &[u8]) -> Result<ParsedResponse<'_>, ParseError> {
    if buffer.is_empty() {
        return Err(ParseError::Empty);
    }

    let hash_index = find_marker(buffer).ok_or(ParseError::NoBinaryMarker)?;

    let text_lines = header_lines(&buffer[..hash_index]);
    if text_lines.len() < HEADER_LINE_COUNT {
        return Err(ParseError::InsufficientHeaderLines {
            got: text_lines.len(),
        });
    }

    let digit_count = buffer
        .get(hash_index + 1)
        .and_then(|b| ascii_digit(*b))
        .ok_or(ParseError::BadDigitCount)?;

    let field_count = text_lines[PREAMBLE_LINE].split(',').count();
    if field_count < MIN_PREAMBLE_FIELDS {
        return Err(ParseError::IncompletePreamble { field_count });
    }

    let length_start = (hash_index + 2).min(buffer.len());
    let data_start = (hash_index + 2 + digit_count).min(buffer.len());
    let declared_byte_length = leading_decimal(&buffer[length_start..data_start]).unwrap_or(0);

    let mut samples = &buffer[data_start..];
    if let Some((&b'\n', rest)) = samples.split_last() {
        samples = rest;
    }

    Ok(ParsedResponse {
        header: ParsedHeader {
            text_lines,
            binary_marker_offset: hash_index,
            digit_count,
            declared_byte_length,
        },
        samples,
    })
}

/// Bounded, printable excerpt of a raw buffer for diagnostics.
pub fn excerpt(buffer: &[u8]) -> String {
    String::from_utf8_lossy(buffer)
        .chars()
        .take(EXCERPT_CHARS)
        .flat_map(|c| {
            let escaped: Vec<char> = if c.is_control() {
                c.escape_default().collect()
            } else {
                vec![c]
            };
            escaped
        })
        .collect()
}

// =============================================================================
// Marker scanning
// =============================================================================

/// Position of the first `#` in `buffer`.
pub(crate) fn find_marker(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == BLOCK_MARKER)
}

/// Non-empty trimmed lines of an ASCII prefix.
pub(crate) fn header_lines(prefix: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(prefix)
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Count of the lines [`header_lines`] would return, without allocating them.
pub(crate) fn count_header_lines(prefix: &[u8]) -> usize {
    String::from_utf8_lossy(prefix)
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .count()
}

pub(crate) fn ascii_digit(byte: u8) -> Option<usize> {
    byte.is_ascii_digit().then(|| usize::from(byte - b'0'))
}

/// Value of the leading run of ASCII digits, if there is one.
pub(crate) fn leading_decimal(bytes: &[u8]) -> Option<usize> {
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    bytes[..digits].iter().try_fold(0usize, |acc, &b| {
        acc.checked_mul(10)?.checked_add(usize::from(b - b'0'))
    })
}
