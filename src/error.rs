//! Error types for the buffer and the container codec.

use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Errors surfaced while encoding or decoding a TBT container.
///
/// None of these are retried internally; any failure aborts the operation
/// and surfaces to the caller with nothing usable produced.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("bad magic number {0:?}, expected \"TBT\"")]
    BadMagic([u8; 3]),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid buffer dimensions {width}x{height}")]
    InvalidDimensions { width: i64, height: i64 },

    #[error("field {0} has a negative value")]
    NegativeField(&'static str),

    #[error("{0} does not fit in a 32-bit field")]
    Oversize(&'static str),

    #[error("truncated stream while reading {0}")]
    Truncated(&'static str),

    #[error("corrupt compressed payload: {0}")]
    CorruptPayload(#[source] io::Error),

    #[error("malformed string length prefix")]
    BadStringLength,

    #[error("metadata string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A cell index outside the buffer bounds.
///
/// Returned by the indexed accessors on [`crate::Buffer`]; indexing never
/// clamps or wraps.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cell ({x}, {y}) is out of bounds for a {width}x{height} buffer")]
pub struct OutOfBounds {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}
