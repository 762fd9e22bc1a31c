use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that have a meaning beyond "the operating system said no".
///
/// These travel inside [`anyhow::Error`]; use `downcast_ref::<Error>()` to
/// tell them apart from plain I/O failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The range list does not have the expected shape.
    #[error("{expected} expected, but \"{found}\" found")]
    Format { expected: &'static str, found: String },

    /// The destination is a block device somebody else holds open.
    #[error("{} is in use (mounted or opened exclusively elsewhere), refusing to write to it", path.display())]
    DeviceBusy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The source ran out before a range was copied completely.
    #[error("source ended with {remaining} bytes left to copy")]
    UnexpectedEnd { remaining: u64 },

    /// A frame does not start with the stream signature.
    #[error("diff stream signature does not match at offset {offset}")]
    BadSignature { offset: u64 },

    /// The stream ended in the middle of a frame.
    #[error("premature end of diff stream at offset {offset}: {missing} more bytes of {what} expected")]
    Truncated {
        offset: u64,
        what: &'static str,
        missing: u64,
    },

    /// A frame header carries values that cannot describe a byte range.
    #[error("invalid frame at offset {offset}: {reason}")]
    InvalidFrame { offset: u64, reason: String },

    #[error("incorrect unit size {0}, expected a positive number of 512-byte sectors")]
    InvalidUnitSize(u64),

    /// Block numbers that do not fit into a byte offset.
    #[error("{what} {value} overflows when multiplied by {unit_bytes} bytes per block")]
    Overflow {
        what: &'static str,
        value: u64,
        unit_bytes: u64,
    },
}
