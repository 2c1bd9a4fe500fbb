//! Vodpack: on-the-fly VOD packaging
//!
//! The packaging core lives in `vodpack-media`; this crate adds the
//! configuration file, JSON job descriptions and the [`package::Packager`]
//! driver used by the `vodpack` binary.

pub mod config;
pub mod job;
pub mod package;

pub use config::PackagerConfig;
pub use job::Job;
pub use package::{OutputFormat, PackageRequest, PackagedSegment, Packager};
