//! Memoized tasks and the graph they form.
//!
//! A [`Task`] is a named unit of work that produces exactly one file. Tasks
//! declare the tasks they depend on; executing a task first executes its
//! transitive dependencies, each exactly once, and then runs its own work.
//!
//! ## Identity
//!
//! `Task` is a cheap handle (`Arc`) around the node. Cloning the handle does
//! not clone the node: two handles are the *same* task iff [`Task::ptr_eq`].
//! This is what allows a derived pipeline to share upstream work with its
//! parent simply by holding the parent's handles.
//!
//! ## Memoization
//!
//! Each task carries a small state machine: pending, running or done. The
//! first caller to find a task pending marks it running and runs the work
//! closure with the lock released; everyone else waits on a condvar until it
//! settles. A failed run puts the task back to pending, so only successes are
//! memoized. The closure therefore runs at most once per process even when
//! several graphs request the task at the same time, and it is free to use
//! the rayon pool itself.

mod diagnostics;
mod runner;

use std::borrow::Cow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use camino::Utf8PathBuf;

pub use crate::engine::diagnostics::{Diagnostics, TaskExecution};
use crate::error::TaskError;
use crate::utils::as_overhead;

type Work = Box<dyn Fn() -> anyhow::Result<Utf8PathBuf> + Send + Sync>;

/// Lazily produces a task when the graph is being collected. `None` means the
/// dependency is absent, which is not an error.
pub type Deferred = Arc<dyn Fn() -> Option<Task> + Send + Sync>;

#[derive(Clone)]
pub enum Dependency {
    Task(Task),
    Deferred(Deferred),
}

impl Dependency {
    fn resolve(&self) -> Option<Task> {
        match self {
            Dependency::Task(task) => Some(task.clone()),
            Dependency::Deferred(func) => func(),
        }
    }
}

impl From<Task> for Dependency {
    fn from(task: Task) -> Self {
        Dependency::Task(task)
    }
}

enum State {
    Pending,
    Running,
    Done(Utf8PathBuf),
}

struct TaskNode {
    name: Cow<'static, str>,
    dependencies: Vec<Dependency>,
    work: Work,
    state: Mutex<State>,
    settled: Condvar,
}

#[derive(Clone)]
pub struct Task(Arc<TaskNode>);

impl Task {
    /// Starts defining a task.
    pub fn builder(name: impl Into<Cow<'static, str>>) -> TaskDef {
        TaskDef {
            name: name.into(),
            dependencies: Vec::new(),
        }
    }

    /// A task that is already resolved to an existing file. Useful for
    /// splicing externally provided inputs into a graph.
    pub fn resolved_to(name: impl Into<Cow<'static, str>>, path: impl Into<Utf8PathBuf>) -> Self {
        let name = name.into();
        let path = path.into();
        let task = Task::builder(name.clone()).run(move || {
            anyhow::bail!("'{name}' is a pre-resolved input and cannot be rebuilt")
        });

        *task.state() = State::Done(path);
        task
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether the work closure has completed successfully.
    pub fn resolved(&self) -> bool {
        self.output().is_some()
    }

    /// The produced file, once resolved.
    pub fn output(&self) -> Option<Utf8PathBuf> {
        match &*self.state() {
            State::Done(path) => Some(path.clone()),
            _ => None,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The produced file, for use inside a dependent's work closure, where
    /// the dependency is guaranteed to have been executed already.
    pub fn path(&self) -> anyhow::Result<Utf8PathBuf> {
        self.output()
            .ok_or_else(|| anyhow::anyhow!("task '{}' has not been executed", self.name()))
    }

    /// Whether both handles point at the same task.
    pub fn ptr_eq(a: &Task, b: &Task) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// The direct dependencies, with deferred ones resolved and absent ones
    /// dropped.
    pub fn dependencies(&self) -> Vec<Task> {
        self.0
            .dependencies
            .iter()
            .filter_map(Dependency::resolve)
            .collect()
    }

    /// Executes every transitive dependency, then this task, and returns the
    /// produced file. Tasks that are already resolved are not run again.
    pub fn execute(&self) -> Result<Utf8PathBuf, TaskError> {
        self.execute_with_diagnostics().map(|(path, _)| path)
    }

    /// Like [`Task::execute`], also reporting what ran and for how long.
    pub fn execute_with_diagnostics(&self) -> Result<(Utf8PathBuf, Diagnostics), TaskError> {
        let diagnostics = runner::run(self)?;
        let path = self.output().ok_or_else(|| TaskError::Failed {
            task: self.name().to_string(),
            source: anyhow::anyhow!("graph finished without resolving the requested task"),
        })?;

        Ok((path, diagnostics))
    }

    /// Runs the work closure unless already resolved. Dependencies must have
    /// been executed by the caller. Returns whether the closure actually ran.
    ///
    /// If another thread is running the closure, this blocks until it is
    /// done, so it must not be called from a rayon worker.
    pub(crate) fn run_local(&self) -> Result<(Utf8PathBuf, bool), TaskError> {
        let mut state = self
            .0
            .settled
            .wait_while(self.state(), |state| matches!(state, State::Running))
            .unwrap_or_else(PoisonError::into_inner);

        if let State::Done(path) = &*state {
            return Ok((path.clone(), false));
        }

        *state = State::Running;
        drop(state);

        let result = self.run_work();

        *self.state() = match &result {
            Ok(path) => State::Done(path.clone()),
            Err(_) => State::Pending,
        };
        self.0.settled.notify_all();

        result.map(|path| (path, true))
    }

    fn run_work(&self) -> Result<Utf8PathBuf, TaskError> {
        let name = self.name();
        tracing::debug!("running task {name}");
        let s = Instant::now();

        match catch_unwind(AssertUnwindSafe(|| (self.0.work)())) {
            Ok(Ok(path)) => {
                tracing::info!("{name} -> {path} {}", as_overhead(s));
                Ok(path)
            }
            Ok(Err(source)) => Err(TaskError::Failed {
                task: name.to_string(),
                source,
            }),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };

                Err(TaskError::Panicked {
                    task: name.to_string(),
                    message,
                })
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.name())
    }
}

/// Builder returned by [`Task::builder`].
pub struct TaskDef {
    name: Cow<'static, str>,
    dependencies: Vec<Dependency>,
}

impl TaskDef {
    pub fn depends_on(mut self, task: &Task) -> Self {
        self.dependencies.push(Dependency::Task(task.clone()));
        self
    }

    pub fn depends_on_all<'a>(mut self, tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        self.dependencies
            .extend(tasks.into_iter().cloned().map(Dependency::Task));
        self
    }

    /// An absent dependency is a no-op.
    pub fn depends_on_opt(mut self, task: Option<&Task>) -> Self {
        if let Some(task) = task {
            self.dependencies.push(Dependency::Task(task.clone()));
        }
        self
    }

    /// A dependency that is only looked up when the graph is executed.
    pub fn depends_on_deferred<F>(mut self, func: F) -> Self
    where
        F: Fn() -> Option<Task> + Send + Sync + 'static,
    {
        self.dependencies.push(Dependency::Deferred(Arc::new(func)));
        self
    }

    pub fn run<F>(self, work: F) -> Task
    where
        F: Fn() -> anyhow::Result<Utf8PathBuf> + Send + Sync + 'static,
    {
        Task(Arc::new(TaskNode {
            name: self.name,
            dependencies: self.dependencies,
            work: Box::new(work),
            state: Mutex::new(State::Pending),
            settled: Condvar::new(),
        }))
    }
}
