//! Compiling declarative step lists into task graphs.
//!
//! A [`Pipeline`] is built from the step list of one side of a
//! [`PipelineConfig`]. Steps are compiled in declared order; every `{…}`
//! reference is resolved against the steps compiled so far or against the
//! data entries, and an unresolved reference fails the compilation before
//! anything runs.
//!
//! A pipeline can be [branched](Pipeline::branch): the branch shares every
//! task before the decompile step with its parent and recompiles the rest
//! against a substituted decompile input.

mod branch;
mod config;
#[cfg(all(test, unix))]
mod incremental;
pub mod step;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

pub use crate::pipeline::config::{ConfigArchive, DataEntry, Function, PipelineConfig};
use crate::engine::Task;
use crate::env::Environment;
use crate::error::ConfigError;
use crate::pipeline::step::{Argument, Step, StepKind};
use crate::steps::{self, Input, StepContext};

const DECOMPILE: &str = "decompile";

/// Well-known points of a pipeline other code can splice work into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// The task whose output the strip step consumes.
    PreStrip,
    /// The task whose output the decompile step consumes.
    PreDecompile,
}

pub struct Pipeline {
    identity: String,
    side: String,
    root: Utf8PathBuf,
    env: Arc<Environment>,
    config: Arc<PipelineConfig>,
    parent: Option<Arc<Pipeline>>,
    data: BTreeMap<String, Task>,
    /// Tasks compiled by this pipeline, by step name.
    tasks: HashMap<String, Task>,
    /// Step names resolved to a substitute instead of the compiled task.
    overrides: HashMap<String, Task>,
    checkpoints: HashMap<Checkpoint, Task>,
    last: Option<Task>,
}

impl Pipeline {
    pub fn builder(
        identity: impl Into<String>,
        env: &Arc<Environment>,
        config: &Arc<PipelineConfig>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            identity: identity.into(),
            env: env.clone(),
            config: config.clone(),
            side: None,
            root: None,
            data: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn side(&self) -> &str {
        &self.side
    }

    /// Directory step outputs are placed under.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn parent(&self) -> Option<&Arc<Pipeline>> {
        self.parent.as_ref()
    }

    /// The step list, in declared order.
    pub fn steps(&self) -> &[Step] {
        self.config
            .steps
            .get(&self.side)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The task of a step, compiled here or inherited from the parent.
    pub fn task(&self, name: &str) -> Option<Task> {
        match self.tasks.get(name) {
            Some(task) => Some(task.clone()),
            None => self.parent.as_ref()?.task(name),
        }
    }

    /// A data entry, looked up through the parent chain.
    pub fn data(&self, key: &str) -> Option<Task> {
        match self.data.get(key) {
            Some(task) => Some(task.clone()),
            None => self.parent.as_ref()?.data(key),
        }
    }

    pub fn checkpoint(&self, checkpoint: Checkpoint) -> Option<Task> {
        match self.checkpoints.get(&checkpoint) {
            Some(task) => Some(task.clone()),
            None => self.parent.as_ref()?.checkpoint(checkpoint),
        }
    }

    /// The terminal task, i.e. that of the last declared step. Always present
    /// on a compiled pipeline.
    pub fn last(&self) -> Option<Task> {
        match &self.last {
            Some(task) => Some(task.clone()),
            None => self.parent.as_ref()?.last(),
        }
    }

    /// What a `{nameOutput}` reference resolves to at this point of the
    /// compilation.
    fn resolve_step(&self, name: &str) -> Option<Task> {
        if let Some(task) = self.overrides.get(name).or_else(|| self.tasks.get(name)) {
            return Some(task.clone());
        }

        self.parent.as_ref()?.resolve_step(name)
    }

    fn decompile_index(&self) -> Result<usize, ConfigError> {
        self.steps()
            .iter()
            .position(|step| step.kind.is(DECOMPILE))
            .ok_or_else(|| ConfigError::MissingStep {
                artifact: self.identity.clone(),
                kind: DECOMPILE.to_string(),
            })
    }

    /// Checks the whole step list before anything is compiled.
    fn validate(&self) -> Result<(), ConfigError> {
        let Some(steps) = self.config.steps.get(&self.side) else {
            return Err(ConfigError::UnknownSide {
                artifact: self.identity.clone(),
                side: self.side.clone(),
            });
        };

        let mut seen = HashSet::new();
        for step in steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateStep {
                    artifact: self.identity.clone(),
                    name: step.name.clone(),
                });
            }
        }

        self.decompile_index()?;
        Ok(())
    }

    /// Compiles the steps from `from` onwards, in declared order.
    fn compile_from(&mut self, from: usize) -> Result<(), ConfigError> {
        let config = self.config.clone();
        let steps = config
            .steps
            .get(&self.side)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for step in &steps[from..] {
            let task = self.compile_step(step)?;

            self.tasks.insert(step.name.clone(), task.clone());
            self.last = Some(task);
        }

        tracing::debug!(
            "compiled {} steps of {} ({})",
            steps.len() - from,
            self.identity,
            self.side
        );

        Ok(())
    }

    fn compile_step(&mut self, step: &Step) -> Result<Task, ConfigError> {
        let mut args = BTreeMap::new();

        for (key, arg) in &step.args {
            let input = match arg {
                Argument::Literal(value) => Input::Literal(value.clone()),
                Argument::Step(name) => {
                    Input::Task(self.resolve_step(name).ok_or_else(|| ConfigError::UnknownTask {
                        artifact: self.identity.clone(),
                        step: step.name.clone(),
                        reference: arg.to_string(),
                    })?)
                }
                Argument::Data(key) => {
                    Input::Task(self.data(key).ok_or_else(|| ConfigError::UnknownData {
                        artifact: self.identity.clone(),
                        step: step.name.clone(),
                        key: key.clone(),
                    })?)
                }
            };

            args.insert(key.clone(), input);
        }

        let checkpoint = match &step.kind {
            StepKind::Strip => Some(Checkpoint::PreStrip),
            kind if kind.is(DECOMPILE) => Some(Checkpoint::PreDecompile),
            _ => None,
        };

        if let (Some(checkpoint), Some(Input::Task(input))) = (checkpoint, args.get("input")) {
            self.checkpoints.insert(checkpoint, input.clone());
        }

        let lookup = |key: &str| self.data(key);
        let ctx = StepContext {
            identity: &self.identity,
            side: &self.side,
            env: &self.env,
            config: &self.config,
            step,
            dir: self.root.join(&step.name),
            args,
            data: &lookup,
        };

        steps::compile(&ctx)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("identity", &self.identity)
            .field("side", &self.side)
            .field("root", &self.root)
            .field("branch", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`Pipeline::builder`].
pub struct PipelineBuilder {
    identity: String,
    env: Arc<Environment>,
    config: Arc<PipelineConfig>,
    side: Option<String>,
    root: Option<Utf8PathBuf>,
    data: BTreeMap<String, Task>,
}

impl PipelineBuilder {
    /// Which step list to compile. Defaults to `joined`.
    pub fn side(mut self, side: impl Into<String>) -> Self {
        self.side = Some(side.into());
        self
    }

    /// Defaults to `<build>/<side>`.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn data(mut self, key: impl Into<String>, task: Task) -> Self {
        self.data.insert(key.into(), task);
        self
    }

    pub fn data_all(mut self, data: impl IntoIterator<Item = (String, Task)>) -> Self {
        self.data.extend(data);
        self
    }

    pub fn compile(self) -> Result<Pipeline, ConfigError> {
        let side = self.side.unwrap_or_else(|| String::from("joined"));
        let root = self
            .root
            .unwrap_or_else(|| self.env.build_dir.join(&side));

        let mut pipeline = Pipeline {
            identity: self.identity,
            side,
            root,
            env: self.env,
            config: self.config,
            parent: None,
            data: self.data,
            tasks: HashMap::new(),
            overrides: HashMap::new(),
            checkpoints: HashMap::new(),
            last: None,
        };

        pipeline.validate()?;
        pipeline.compile_from(0)?;

        Ok(pipeline)
    }
}

impl ConfigArchive {
    /// Compiles the pipeline of `side`, with this archive's data entries
    /// extracted below its root.
    pub fn pipeline(&self, env: &Arc<Environment>, side: &str) -> Result<Pipeline, ConfigError> {
        let root = env.build_dir.join(side);
        let data = self.data_tasks(env, side, &root);

        Pipeline::builder(self.identity(), env, self.config())
            .side(side)
            .root(root)
            .data_all(data)
            .compile()
    }
}
