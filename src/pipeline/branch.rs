use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::engine::Task;
use crate::error::ConfigError;
use crate::pipeline::step::Argument;
use crate::pipeline::{Checkpoint, Pipeline};

impl Pipeline {
    /// Derives a pipeline whose decompile step consumes `replacement` instead
    /// of the output of the step it is configured to read.
    ///
    /// Steps declared before the decompile step are not compiled again: the
    /// branch hands out the parent's tasks, so their work is shared. The
    /// decompile step and every step after it are compiled again with outputs
    /// under `root`. Data entries are read through to the parent.
    pub fn branch(
        parent: &Arc<Pipeline>,
        root: impl Into<Utf8PathBuf>,
        replacement: Task,
    ) -> Result<Pipeline, ConfigError> {
        let index = parent.decompile_index()?;
        let decompile = &parent.steps()[index];

        let input = match decompile.arg("input") {
            Some(Argument::Step(name)) => name.clone(),
            Some(other) => {
                return Err(ConfigError::BranchInput {
                    artifact: parent.identity.clone(),
                    reason: format!("decompile input '{other}' is not a step output"),
                });
            }
            None => {
                return Err(ConfigError::BranchInput {
                    artifact: parent.identity.clone(),
                    reason: String::from("decompile step has no input"),
                });
            }
        };

        let mut branch = Pipeline {
            identity: parent.identity.clone(),
            side: parent.side.clone(),
            root: root.into(),
            env: parent.env.clone(),
            config: parent.config.clone(),
            parent: Some(parent.clone()),
            data: BTreeMap::new(),
            tasks: HashMap::new(),
            overrides: HashMap::from([(input.clone(), replacement)]),
            checkpoints: HashMap::new(),
            last: None,
        };

        tracing::debug!(
            "branching {} ({}) at '{input}' into {}",
            branch.identity,
            branch.side,
            branch.root
        );

        branch.compile_from(index)?;

        // the decompile step recorded the replacement as its input
        debug_assert!(branch.checkpoints.contains_key(&Checkpoint::PreDecompile));

        Ok(branch)
    }
}
