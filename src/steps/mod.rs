//! The step kinds a pipeline can be built from.
//!
//! Every step compiles to exactly one [`Task`] whose output lives at
//! `<root>/<name>/output.<ext>`, and every step body follows the same
//! freshness rule: the output is reused iff it exists and its manifest is
//! the same as the recorded one. Otherwise the body asks the execution mode
//! for permission, forgets the stale record, does the work, and only then
//! records the new manifest.

mod download;
mod function;
mod inject;
mod libraries;
mod strip;

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cache::CacheManifest;
use crate::engine::Task;
use crate::env::Environment;
use crate::error::ConfigError;
use crate::pipeline::PipelineConfig;
use crate::pipeline::step::{Step, StepKind};

/// A step argument after its reference has been resolved.
#[derive(Debug, Clone)]
pub(crate) enum Input {
    Literal(String),
    Task(Task),
}

/// Everything a step needs to compile itself.
pub(crate) struct StepContext<'a> {
    pub(crate) identity: &'a str,
    pub(crate) side: &'a str,
    pub(crate) env: &'a Arc<Environment>,
    pub(crate) config: &'a PipelineConfig,
    pub(crate) step: &'a Step,
    /// `<root>/<name>`
    pub(crate) dir: Utf8PathBuf,
    pub(crate) args: BTreeMap<String, Input>,
    /// Looks up data entries, including those of parent pipelines.
    pub(crate) data: &'a dyn Fn(&str) -> Option<Task>,
}

impl StepContext<'_> {
    pub(crate) fn name(&self) -> &str {
        &self.step.name
    }

    pub(crate) fn output(&self, ext: &str) -> Utf8PathBuf {
        self.dir.join(format!("output.{ext}"))
    }

    pub(crate) fn literal(&self, arg: &str) -> Option<&str> {
        match self.args.get(arg)? {
            Input::Literal(value) => Some(value),
            Input::Task(_) => None,
        }
    }

    /// A file argument. A literal value is taken as a path to an existing
    /// file.
    pub(crate) fn file(&self, arg: &str) -> Result<Task, ConfigError> {
        self.file_opt(arg)?.ok_or_else(|| self.missing(arg))
    }

    pub(crate) fn file_opt(&self, arg: &str) -> Result<Option<Task>, ConfigError> {
        Ok(match self.args.get(arg) {
            Some(Input::Task(task)) => Some(task.clone()),
            Some(Input::Literal(path)) => Some(Task::resolved_to(
                format!("{}:{arg}", self.name()),
                Utf8PathBuf::from(path),
            )),
            None => None,
        })
    }

    pub(crate) fn missing(&self, arg: &str) -> ConfigError {
        ConfigError::MissingArgument {
            artifact: self.identity.to_string(),
            step: self.name().to_string(),
            arg: arg.to_string(),
        }
    }
}

pub(crate) fn compile(ctx: &StepContext<'_>) -> Result<Task, ConfigError> {
    match &ctx.step.kind {
        StepKind::Download => download::compile(ctx),
        StepKind::Strip => strip::compile(ctx),
        StepKind::Inject => inject::compile(ctx),
        StepKind::ListLibraries => libraries::compile(ctx),
        StepKind::Custom(kind) => match ctx.config.functions.get(kind) {
            Some(function) => function::compile(ctx, function),
            None => Err(ConfigError::UnknownStepType {
                artifact: ctx.identity.to_string(),
                step: ctx.name().to_string(),
                kind: kind.clone(),
            }),
        },
    }
}

/// Applies the freshness rule to `output`. Returns `output` untouched if it is
/// up to date, otherwise runs `work` to produce it and records `cache`.
pub(crate) fn guarded(
    env: &Environment,
    task: &str,
    output: &Utf8Path,
    cache: &mut CacheManifest,
    work: impl FnOnce() -> anyhow::Result<()>,
) -> anyhow::Result<Utf8PathBuf> {
    if cache.is_up_to_date(output) {
        tracing::debug!("{task} is up to date");
        return Ok(output.to_path_buf());
    }

    env.mode.assert_not_cache_only(task)?;
    cache.discard()?;

    if let Some(dir) = output.parent() {
        std::fs::create_dir_all(dir)?;
    }

    work()?;
    cache.save()?;

    Ok(output.to_path_buf())
}
