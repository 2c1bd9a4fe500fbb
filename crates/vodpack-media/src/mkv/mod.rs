//! WebM output: EBML primitives, init segment and cluster writer.

pub mod cluster;
pub mod ebml;
pub mod init;

pub use cluster::{BlockEncryption, ClusterHeader, ClusterWriter};
pub use init::init_segment;
