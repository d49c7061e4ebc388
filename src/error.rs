//! Error types for OSM file I/O.
//!
//! A single crate-level [`Error`] covers the read and write pipelines; the
//! variants map one-to-one onto failure kinds rather than onto modules.
//! The enum is `#[non_exhaustive]` so variants can be added without breaking
//! callers; consumers should include a fallback match arm.
//!
//! [`BufferIsFull`] is deliberately not an `Error` variant at its point of
//! origin: a full buffer is a recoverable condition (flush and retry) and is
//! signalled by a lightweight unit type. It converts into [`Error::BufferFull`]
//! only when a caller gives up on recovery.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Recoverable "buffer is full" signal.
///
/// Returned by buffer and builder operations on a fixed-size buffer when an
/// append would exceed capacity. The buffer itself is left untouched past the
/// last commit; callers flush (or hand off) the buffer and retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferIsFull;

impl fmt::Display for BufferIsFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer is full")
    }
}

impl std::error::Error for BufferIsFull {}

/// Errors from reading or writing OSM files.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Underlying read/write failed or returned short.
    Io(io::Error),
    /// Envelope or block violation: bad size, bad blob type, protobuf parse
    /// failure, unknown group, invalid string-table index, bad coordinate.
    Format { detail: String },
    /// Blob carries a compression scheme we do not read (lzma).
    UnsupportedCompression,
    /// HeaderBlock required feature not recognized.
    UnsupportedFeature { feature: String },
    /// No registered factory for the requested format.
    UnsupportedFormat { detail: String },
    /// Output file already exists and overwriting was not allowed.
    FileExists { path: PathBuf },
    /// A fixed-size buffer could not take another item.
    BufferFull,
    /// Not enough points for a linestring or ring. Reserved for geometry
    /// consumers building on the buffer model.
    Geometry { detail: String },
    /// Operation on a closed or errored writer.
    WriterState { detail: &'static str },
}

impl Error {
    /// Creates a format error with human-readable context.
    #[inline]
    pub fn format(detail: impl Into<String>) -> Self {
        Self::Format {
            detail: detail.into(),
        }
    }

    /// Creates an unsupported-format error with human-readable context.
    #[inline]
    pub fn unsupported_format(detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Format { detail } => write!(f, "format error: {detail}"),
            Self::UnsupportedCompression => write!(f, "unsupported compression (lzma)"),
            Self::UnsupportedFeature { feature } => {
                write!(f, "required feature not supported: {feature}")
            }
            Self::UnsupportedFormat { detail } => write!(f, "unsupported format: {detail}"),
            Self::FileExists { path } => {
                write!(f, "output file already exists: {}", path.display())
            }
            Self::BufferFull => write!(f, "buffer is full"),
            Self::Geometry { detail } => write!(f, "geometry error: {detail}"),
            Self::WriterState { detail } => write!(f, "writer state error: {detail}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<BufferIsFull> for Error {
    fn from(_: BufferIsFull) -> Self {
        Self::BufferFull
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::Format {
            detail: format!("protobuf decode failed: {err}"),
        }
    }
}
