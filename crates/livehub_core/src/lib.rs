#![forbid(unsafe_code)]

pub mod config;
pub mod pipeline;
pub mod sources;
pub mod util;

pub use pipeline::{Event, Pipeline, PipelineConfig, PipelineHandle, Session, StatsSnapshot};
