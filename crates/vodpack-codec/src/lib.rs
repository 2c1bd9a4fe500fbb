//! AVC and HEVC bitstream parsing for vodpack.
//!
//! Pattern encryption has to leave every slice header in the clear, so the
//! packager needs the exact byte length of each header. That depends on the
//! active SPS/PPS, which is why this crate keeps parameter-set state per
//! track:
//!
//! - [`config`] - `avcC` / `hvcC` decoder configuration records
//! - [`nal`] - NAL unit types, emulation prevention, length prefixes
//! - [`avc`], [`hevc`] - parameter sets and slice header sizing
//! - [`slice`] - [`SliceParser`], the codec-independent entry point
//!
//! ```
//! use vodpack_codec::nal;
//!
//! let rbsp = nal::remove_emulation_prevention(&[0x00, 0x00, 0x03, 0x01]);
//! assert_eq!(&*rbsp, &[0x00, 0x00, 0x01]);
//! ```

pub mod avc;
pub mod bits;
pub mod config;
pub mod error;
pub mod hevc;
pub mod nal;
pub mod slice;

#[cfg(test)]
mod testing;

pub use avc::AvcParser;
pub use bits::BitReader;
pub use config::DecoderConfig;
pub use error::{CodecError, Result};
pub use hevc::HevcParser;
pub use slice::SliceParser;
