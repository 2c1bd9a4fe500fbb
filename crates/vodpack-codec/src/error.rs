//! Error types for vodpack-codec

/// Errors raised while parsing codec bitstreams
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The bitstream ended before the syntax element was complete
    #[error("Unexpected end of bitstream")]
    UnexpectedEof,

    /// The bitstream violates the codec syntax
    #[error("Invalid bitstream: {0}")]
    BadData(String),

    /// The bitstream uses a feature this parser does not handle
    #[error("Unsupported bitstream feature: {0}")]
    Unsupported(String),
}

impl CodecError {
    /// Create a new BadData error.
    pub fn bad_data<S: Into<String>>(msg: S) -> Self {
        Self::BadData(msg.into())
    }

    /// Create a new Unsupported error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }
}

/// Result type alias for codec parsing
pub type Result<T> = std::result::Result<T, CodecError>;
