//! Parse errors for the textual forms of shared types.

/// Common error type for vodpack shared types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The codec name is not known.
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    /// The media type name is not known.
    #[error("Unknown media type: {0}")]
    UnknownMediaType(String),

    /// The encryption scheme name is not known.
    #[error("Unknown encryption scheme: {0}")]
    UnknownScheme(String),
}

impl Error {
    /// Create a new UnknownCodec error.
    pub fn unknown_codec<S: Into<String>>(name: S) -> Self {
        Self::UnknownCodec(name.into())
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unknown_codec("mpeg2");
        assert_eq!(err.to_string(), "Unknown codec: mpeg2");

        let err = Error::UnknownScheme("cens".into());
        assert_eq!(err.to_string(), "Unknown encryption scheme: cens");
    }
}
