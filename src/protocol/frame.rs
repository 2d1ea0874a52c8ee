//! Incremental Response Framing
//!
//! The text protocol has no length prefix on most replies, so the reader
//! has to recognise the end of a reply from its content. This module does
//! that without consuming anything: given everything read so far, it says
//! whether a complete reply is present and how many bytes it spans.
//!
//! ## How Framing Works
//!
//! [`frame_response`] walks the buffer line by line:
//!
//! - For [`TerminatorClass::NoResponseExpected`] verbs the first complete
//!   line is the whole reply, except a meta `VA <n>` header, which is
//!   followed by an `n`-byte data block and its CRLF.
//! - For [`TerminatorClass::TerminatedByMarker`] verbs the reply ends at the
//!   first line that is a marker (`END`, `STORED`, `SERVER_ERROR ...`).
//!   `VALUE <key> <flags> <bytes>` headers are honoured: their data block is
//!   skipped by length, so a stored value that happens to read `END` can
//!   never end the reply early.
//!
//! Matching is anchored on whole lines. A marker that appears inside a line
//! (`key=END ...`, `xxERROR`) is never a terminator.
//!
//! The caller appends network data to its buffer and calls
//! [`frame_response`] again until it returns `Some`, exactly like the
//! incremental parse loop of a server reading requests.

use crate::protocol::types::{is_marker_line, TerminatorClass, CRLF};

/// Header prefix of a retrieval data block
const VALUE_PREFIX: &[u8] = b"VALUE ";

/// Header prefix of a meta data block
const META_VALUE_PREFIX: &[u8] = b"VA ";

/// Returns the length of the first complete reply in `buf`, if there is one.
///
/// - `Some(len)` - `buf[..len]` is a complete reply including its final CRLF
/// - `None` - more data is needed
pub fn frame_response(buf: &[u8], class: TerminatorClass) -> Option<usize> {
    let mut pos = 0;

    loop {
        let line_end = pos + find_crlf(&buf[pos..])?;
        let line = &buf[pos..line_end];
        let next = line_end + CRLF.len();

        match class {
            TerminatorClass::NoResponseExpected => {
                return match declared_length(line, META_VALUE_PREFIX, 1) {
                    Some(len) => block_end(buf, next, len),
                    None => Some(next),
                };
            }
            TerminatorClass::TerminatedByMarker => {
                if let Some(len) = declared_length(line, VALUE_PREFIX, 3) {
                    pos = block_end(buf, next, len)?;
                    continue;
                }

                if is_marker_line(line) {
                    return Some(next);
                }

                pos = next;
            }
        }
    }
}

/// Splits `buf` into the lengths of `classes.len()` consecutive replies.
///
/// Stops at the first reply that is not yet complete, so the result may be
/// shorter than `classes`.
pub fn frame_responses(buf: &[u8], classes: &[TerminatorClass]) -> Vec<usize> {
    let mut lengths = Vec::with_capacity(classes.len());
    let mut pos = 0;

    for class in classes {
        match frame_response(&buf[pos..], *class) {
            Some(len) => {
                lengths.push(len);
                pos += len;
            }
            None => break,
        }
    }

    lengths
}

/// End offset of a data block of `len` bytes starting at `start`, if the
/// block and its trailing CRLF have fully arrived.
fn block_end(buf: &[u8], start: usize, len: usize) -> Option<usize> {
    let end = start.checked_add(len)?.checked_add(CRLF.len())?;
    (buf.len() >= end).then_some(end)
}

/// Reads the byte count from a data block header.
///
/// `index` is the position of the count among the space-separated tokens
/// (`VALUE <key> <flags> <bytes>` has it at 3, `VA <bytes>` at 1). A header
/// whose count does not parse is treated as an ordinary line.
fn declared_length(line: &[u8], prefix: &[u8], index: usize) -> Option<usize> {
    if !line.starts_with(prefix) {
        return None;
    }

    let token = line.split(|b| *b == b' ').nth(index)?;
    std::str::from_utf8(token).ok()?.parse().ok()
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
