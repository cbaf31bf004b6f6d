use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as RuntimeError;

/// Top-level error for a compile-then-execute run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Execution error:\n{0}")]
    Task(#[from] TaskError),
}

/// A problem with the declarative pipeline configuration. These are detected
/// while compiling a pipeline, before any task has executed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{artifact}: step '{step}' has unknown type '{kind}'")]
    UnknownStepType {
        artifact: String,
        step: String,
        kind: String,
    },

    #[error("{artifact}: step '{step}' references unknown task '{reference}'")]
    UnknownTask {
        artifact: String,
        step: String,
        reference: String,
    },

    #[error("{artifact}: step '{step}' references unknown data entry '{key}'")]
    UnknownData {
        artifact: String,
        step: String,
        key: String,
    },

    #[error("{artifact}: step '{step}' uses unknown placeholder '{{{token}}}'")]
    UnknownPlaceholder {
        artifact: String,
        step: String,
        token: String,
    },

    #[error("{artifact}: step '{step}' is missing required argument '{arg}'")]
    MissingArgument {
        artifact: String,
        step: String,
        arg: String,
    },

    #[error("{artifact}: no step of type '{kind}' in the pipeline")]
    MissingStep { artifact: String, kind: String },

    #[error("{artifact}: step name '{name}' is declared twice")]
    DuplicateStep { artifact: String, name: String },

    #[error("{artifact}: no steps declared for side '{side}'")]
    UnknownSide { artifact: String, side: String },

    #[error("{artifact}: unsupported config spec {spec}")]
    UnsupportedSpec { artifact: String, spec: u32 },

    #[error("{artifact}: '{path}' would be written outside of its directory")]
    UnsafePath { artifact: String, path: String },

    #[error("{artifact}: cannot branch: {reason}")]
    BranchInput { artifact: String, reason: String },

    #[error("Malformed reference '{0}'")]
    MalformedReference(String),

    #[error("Malformed artifact coordinate '{0}'")]
    MalformedCoordinate(String),

    #[error("{artifact}: invalid config.json\n{source}")]
    Json {
        artifact: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{artifact}: unreadable config archive\n{source}")]
    Archive {
        artifact: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A failure while executing a task graph.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{task}' failed:\n{source}")]
    Failed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task '{task}' panicked: {message}")]
    Panicked { task: String, message: String },

    #[error("Dependency '{dependency}' of task '{task}' failed:\n{source}")]
    Dependency {
        task: String,
        dependency: String,
        #[source]
        source: Box<TaskError>,
    },

    #[error("Cycle detected in task graph at '{task}'")]
    Cycle { task: String },
}

impl TaskError {
    /// Names of the tasks from the requested one down to the task that
    /// actually failed.
    pub fn chain(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = self;

        loop {
            match current {
                TaskError::Dependency { task, source, .. } => {
                    names.push(task.as_str());
                    current = source;
                }
                TaskError::Failed { task, .. }
                | TaskError::Panicked { task, .. }
                | TaskError::Cycle { task } => {
                    names.push(task.as_str());
                    return names;
                }
            }
        }
    }

    /// The innermost task error, i.e. the one raised by the failing task.
    pub fn root(&self) -> &TaskError {
        match self {
            TaskError::Dependency { source, .. } => source.root(),
            other => other,
        }
    }

    /// If the run was aborted because the execution mode forbade the needed
    /// action, returns that violation.
    pub fn mode_violation(&self) -> Option<&ModeError> {
        match self.root() {
            TaskError::Failed { source, .. } => source.downcast_ref::<ModeError>(),
            _ => None,
        }
    }
}

/// The execution mode forbade an action a step needed to perform.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModeError {
    #[error("Offline mode is enabled, refusing to {action}")]
    Offline { action: String },

    #[error("Cache-only mode is enabled, but '{task}' is not up to date")]
    CacheOnly { task: String },
}

/// A failure of an external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Couldn't start '{program}'\n{source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{tool}' exited with {status}, see {log}")]
    Exit {
        tool: String,
        status: String,
        log: Utf8PathBuf,
    },

    #[error("'{tool}' finished but did not produce {output}")]
    MissingOutput { tool: String, output: Utf8PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
