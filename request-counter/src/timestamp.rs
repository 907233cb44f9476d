//! Fixed-layout binary encoding of request timestamps.
//!
//! Every record is exactly [`RECORD_LEN`] bytes:
//!
//! * 1 byte record version ([`RECORD_VERSION`])
//! * 8 bytes seconds since the Unix epoch, `i64` big-endian
//! * 4 bytes nanoseconds within that second, `u32` big-endian
//! * 1 byte terminator, `b'\n'`
//!
//! Timestamps are always UTC, so no offset is stored. There is no checksum;
//! a record is accepted only if the version, the terminator and the decoded
//! instant are all valid.

use chrono::{DateTime, Utc};
use displaydoc::Display;

/// A request arrival time.
pub type Timestamp = DateTime<Utc>;

/// Version byte at the start of every record.
pub const RECORD_VERSION: u8 = 1;

/// Terminator byte at the end of every record.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Size in bytes of one encoded record.
pub const RECORD_LEN: usize = 1 + 8 + 4 + 1;

/// Reasons a record fails to decode
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum DecodeError {
    /// Record truncated: {0} of 14 bytes
    Truncated(usize),
    /// Unknown record version: {0}
    Version(u8),
    /// Missing record terminator, found {0}
    Terminator(u8),
    /// Timestamp out of range: {secs}s + {nanos}ns
    OutOfRange {
        /// Seconds field
        secs: i64,
        /// Nanoseconds field
        nanos: u32,
    },
}

impl std::error::Error for DecodeError {}

/// Encode a timestamp into one record.
pub fn encode(ts: &Timestamp) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0] = RECORD_VERSION;
    buf[1..9].copy_from_slice(&ts.timestamp().to_be_bytes());
    buf[9..13].copy_from_slice(&ts.timestamp_subsec_nanos().to_be_bytes());
    buf[13] = RECORD_TERMINATOR;
    buf
}

/// Decode one record from the front of `bytes`.
///
/// Only the first [`RECORD_LEN`] bytes are looked at, trailing data is ignored.
pub fn decode(bytes: &[u8]) -> Result<Timestamp, DecodeError> {
    let Some(record) = bytes.get(..RECORD_LEN) else {
        return Err(DecodeError::Truncated(bytes.len()));
    };
    if record[0] != RECORD_VERSION {
        return Err(DecodeError::Version(record[0]));
    }
    if record[13] != RECORD_TERMINATOR {
        return Err(DecodeError::Terminator(record[13]));
    }

    let mut secs = [0u8; 8];
    secs.copy_from_slice(&record[1..9]);
    let secs = i64::from_be_bytes(secs);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&record[9..13]);
    let nanos = u32::from_be_bytes(nanos);

    DateTime::from_timestamp(secs, nanos).ok_or(DecodeError::OutOfRange { secs, nanos })
}
