//! Typed ID wrappers.
//!
//! Frame data is addressed by `(SourceId, offset)`. Keeping the source
//! identifier a distinct type prevents mixing it up with track indexes or
//! cache slot ids, which are also small integers.

use serde::{Deserialize, Serialize};

/// Identifier of one physical input (usually a file) of a packaging request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(u32);

impl SourceId {
    /// Wrap a raw source index.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw source index.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for SourceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_roundtrip() {
        let id = SourceId::from(7);
        assert_eq!(id.get(), 7);
        assert_eq!(id.to_string(), "source#7");
    }

    #[test]
    fn test_source_id_serde_transparent() {
        let json = serde_json::to_string(&SourceId::new(12)).unwrap();
        assert_eq!(json, "12");
        let id: SourceId = serde_json::from_str("12").unwrap();
        assert_eq!(id, SourceId::new(12));
    }

    #[test]
    fn test_source_id_ordering() {
        assert!(SourceId::new(1) < SourceId::new(2));
    }
}
