//! Conversion jobs and their on-disk layout.

pub mod model;
pub mod paths;

pub use model::{
    ErrorKind, FailureReport, InputLayout, Job, JobId, JobStatus, OutputProjection,
    ProjectionParams,
};
pub use paths::JobPaths;
