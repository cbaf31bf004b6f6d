#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod artifact;
mod cache;
mod core;
mod engine;
mod env;
mod error;
mod fetch;
mod mode;
pub mod pipeline;
mod steps;
mod tool;
mod utils;

pub use crate::artifact::Artifact;
pub use crate::cache::{CacheManifest, Source};
pub use crate::core::Hash32;
pub use crate::engine::{Deferred, Dependency, Diagnostics, Task, TaskDef, TaskExecution};
pub use crate::env::{Environment, EnvironmentBuilder};
pub use crate::error::*;
pub use crate::fetch::{Downloader, FileFetcher, Fetcher};
pub use crate::mode::ExecutionMode;
pub use crate::pipeline::step::{Argument, Step, StepKind};
pub use crate::pipeline::{
    Checkpoint, ConfigArchive, DataEntry, Function, Pipeline, PipelineBuilder, PipelineConfig,
};
pub use crate::tool::ExternalTool;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::utils::{as_overhead, walk_files};
