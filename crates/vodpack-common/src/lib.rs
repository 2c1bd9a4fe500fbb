//! Vodpack-Common: Shared identifiers and media enums.
//!
//! This crate provides the small vocabulary shared by every vodpack crate:
//!
//! - **Typed IDs**: [`SourceId`] names one physical input (file) of a request
//! - **Core Types**: media types, codec ids with their container mappings, and
//!   encryption schemes
//! - **Error Handling**: parse errors for the textual forms of these types
//!
//! # Examples
//!
//! ```
//! use vodpack_common::{CodecId, MediaType, SourceId};
//!
//! let source = SourceId::new(3);
//! assert_eq!(source.get(), 3);
//!
//! let codec: CodecId = "avc".parse().unwrap();
//! assert_eq!(codec.media_type(), MediaType::Video);
//! assert_eq!(codec.webm_codec_id(), Some("V_MPEG4/ISO/AVC"));
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
