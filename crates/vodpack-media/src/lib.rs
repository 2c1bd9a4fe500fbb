//! Vodpack-Media: segment packaging core
//!
//! Turns demuxed frame metadata into fragmented MP4 and WebM segments,
//! optionally encrypted, while streaming frame bytes from their sources
//! through a small pool of reusable read buffers.
//!
//! # Modules
//!
//! - `media` - frames, frame parts, tracks and sequences
//! - `read_cache` - shared read buffers with coalescing and read-ahead
//! - `source` - frame sources and the resumable `process()` protocol
//! - `layout` - two-pass size/write discipline for boxes and elements
//! - `mp4` - ISOBMFF boxes, init segment, multi-track muxer
//! - `dash` - DASH fragment header
//! - `mkv` - EBML, WebM init segment and cluster writer
//! - `crypto` - CENC, cbcs, source decryption and passthrough
//! - `segment` - picks header and frame pipeline per container and scheme
//!
//! # Flow
//!
//! A segment is produced in two steps. The header builder measures every
//! box from the frame metadata alone and emits the header; then a
//! [`SegmentProcessor`] streams the frame data behind it. `process()`
//! returns [`Progress::Pending`] whenever the read cache has to be filled,
//! and picks up where it left off on the next call.

pub mod crypto;
pub mod dash;
pub mod error;
pub mod frame_writer;
pub mod layout;
pub mod media;
pub mod mkv;
pub mod mp4;
pub mod read_cache;
pub mod segment;
pub mod source;
pub mod write;

pub use error::{Error, ErrorClass, Result};
pub use frame_writer::FrameWriter;
pub use layout::{Layout, Measured};
pub use media::{DrmInfo, Frame, FramePart, MediaInfo, SampleProtection, Sequence, SourceRef, Track};
pub use read_cache::{FileReader, ReadCache, SourceReader};
pub use segment::{build_segment, segment_size, Container, Segment, SegmentRequest};
pub use source::{run_to_completion, Progress, SegmentProcessor};
pub use write::{IoSegmentWriter, SegmentWriter, SizeCounter, WriteBuffer};
