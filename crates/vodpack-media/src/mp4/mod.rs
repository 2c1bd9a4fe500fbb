//! Fragmented MP4 output: box builders, init segment and the multi-track
//! muxer.

pub mod boxes;
pub mod init;
pub mod muxer;

pub use init::{init_segment, InitParams, InitProtection, InitSegment};
pub use muxer::{MuxSink, Muxer};
