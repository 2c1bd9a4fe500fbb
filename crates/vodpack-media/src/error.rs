//! Error types for vodpack-media.

use std::io;
use thiserror::Error;
use vodpack_codec::CodecError;

/// Result type for vodpack-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for vodpack-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading a source or writing a segment.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or truncated input data.
    #[error("Bad data: {0}")]
    BadData(String),

    /// The request cannot be served with the given media set.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unsupported codec or container feature.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// An internal invariant was violated, e.g. a box wrote more bytes than
    /// it measured.
    #[error("Unexpected: {0}")]
    Unexpected(String),

    /// A buffer could not be allocated.
    #[error("Allocation failed: {0}")]
    AllocFailed(String),

    /// Bitstream parsing failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Response class a caller maps a fatal error to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The input (media set, source files, request) is at fault.
    BadInput,
    /// The packager itself failed.
    ServerFault,
}

impl Error {
    /// Create a bad data error.
    pub fn bad_data(msg: impl Into<String>) -> Self {
        Self::BadData(msg.into())
    }

    /// Create a bad request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an unexpected (internal invariant) error.
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Create an allocation failure error.
    pub fn alloc_failed(msg: impl Into<String>) -> Self {
        Self::AllocFailed(msg.into())
    }

    /// Classify the error for the caller's response.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BadData(_) | Self::BadRequest(_) | Self::Unsupported(_) | Self::Codec(_) => ErrorClass::BadInput,
            Self::Io(_) | Self::Unexpected(_) | Self::AllocFailed(_) => ErrorClass::ServerFault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::bad_data("zero size packet");
        assert_eq!(err.to_string(), "Bad data: zero size packet");

        let err = Error::unexpected("moof wrote 10 bytes, measured 8");
        assert_eq!(err.to_string(), "Unexpected: moof wrote 10 bytes, measured 8");
    }

    #[test]
    fn test_error_class() {
        assert_eq!(Error::bad_request("no frames").class(), ErrorClass::BadInput);
        assert_eq!(Error::Codec(CodecError::UnexpectedEof).class(), ErrorClass::BadInput);
        assert_eq!(Error::alloc_failed("slot").class(), ErrorClass::ServerFault);
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert_eq!(Error::from(io_err).class(), ErrorClass::ServerFault);
    }
}
