//! Media analysis.

pub mod probe;

pub use probe::{MediaInfo, ProbeResult, VideoStream};
