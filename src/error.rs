//! Error types shared by every image format in this crate.

use std::io;
use thiserror::Error;

/// Unified error type for image-layer operations.
///
/// One variant per failure kind so callers can match on *what* went wrong
/// without parsing message strings. Host I/O errors keep their
/// [`io::Error`] source for context.
#[derive(Debug, Error)]
pub enum ImageError {
    /// A source path could not be opened.
    #[error("cannot open '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A host read returned fewer bytes than required, or the OS reported
    /// an error.
    #[error("read error at offset 0x{offset:x}: {detail}")]
    Read { offset: u64, detail: String },

    /// Host seek failure.
    #[error("seek error at offset 0x{offset:x}: {source}")]
    Seek {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Writer-tap host write failure. Sticky: once raised, the writer is
    /// poisoned and `finish_image` reports it.
    #[error("write error in image writer: {0}")]
    Write(String),

    /// Header signature or version mismatch.
    #[error("invalid signature: {0}")]
    Magic(&'static str),

    /// Known format, unsupported variant (e.g. encrypted QCOW2).
    #[error("unsupported image feature: {0}")]
    Unsupported(String),

    /// Bad arguments: backing loop, size out of range, inconsistent
    /// segment set.
    #[error("invalid image arguments: {0}")]
    Arg(String),

    /// Read starting at or past the end of the image.
    #[error("offset 0x{offset:x} is beyond image size (0x{size:x})")]
    ReadOffset { offset: u64, size: u64 },
}

impl ImageError {
    /// Wrap an [`io::Error`] produced while reading at `offset`.
    pub(crate) fn read_io(offset: u64, err: io::Error) -> Self {
        ImageError::Read {
            offset,
            detail: err.to_string(),
        }
    }

    /// A read that came back short of the required byte count.
    pub(crate) fn short_read(offset: u64, wanted: usize, got: usize) -> Self {
        ImageError::Read {
            offset,
            detail: format!("short read: wanted {} bytes, got {}", wanted, got),
        }
    }
}

/// Convert to [`io::Error`] so `Read`/`Seek` impls can surface the
/// underlying failure without flattening it to a string first.
impl From<ImageError> for io::Error {
    fn from(err: ImageError) -> Self {
        let kind = match &err {
            ImageError::Open { .. } => io::ErrorKind::NotFound,
            ImageError::ReadOffset { .. } | ImageError::Arg(_) => io::ErrorKind::InvalidInput,
            ImageError::Magic(_) | ImageError::Unsupported(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
