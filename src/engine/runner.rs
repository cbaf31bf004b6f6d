use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Diagnostics, Task, TaskExecution};
use crate::error::TaskError;

/// The transitive dependency graph of one requested task. Edges point from a
/// dependency to its dependent.
struct Plan {
    graph: Graph<Task, ()>,
    root: NodeIndex,
}

impl Plan {
    /// Walks the dependencies of `root`. Every distinct task becomes exactly
    /// one node, however many dependents it has. Resolved tasks are leaves:
    /// whatever they depended on has already run.
    fn collect(root: &Task) -> Self {
        let mut graph = Graph::new();
        let mut nodes = HashMap::new();

        let root_index = graph.add_node(root.clone());
        nodes.insert(root.id(), root_index);

        let mut queue = VecDeque::from([root_index]);

        while let Some(index) = queue.pop_front() {
            let task = graph[index].clone();
            if task.resolved() {
                continue;
            }

            for dependency in task.dependencies() {
                let dep_index = match nodes.get(&dependency.id()) {
                    Some(&existing) => existing,
                    None => {
                        let added = graph.add_node(dependency.clone());
                        nodes.insert(dependency.id(), added);
                        queue.push_back(added);
                        added
                    }
                };

                graph.update_edge(dep_index, index, ());
            }
        }

        Self {
            graph,
            root: root_index,
        }
    }

    /// Wraps a failure of `failed` with every task on a dependency path up to
    /// the requested root.
    fn attribute(&self, failed: NodeIndex, error: TaskError) -> TaskError {
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([failed]);
        let mut seen = HashSet::from([failed]);

        while let Some(index) = queue.pop_front() {
            if index == self.root {
                break;
            }
            for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(dependent) {
                    parent.insert(dependent, index);
                    queue.push_back(dependent);
                }
            }
        }

        // walk back from the root, collecting the path towards the failure
        let mut path = vec![self.root];
        let mut current = self.root;
        while let Some(&next) = parent.get(&current) {
            path.push(next);
            current = next;
        }

        path.windows(2).rev().fold(error, |source, pair| {
            let (dependent, dependency) = (pair[0], pair[1]);
            TaskError::Dependency {
                task: self.graph[dependent].name().to_string(),
                dependency: self.graph[dependency].name().to_string(),
                source: Box::new(source),
            }
        })
    }
}

type Message = (NodeIndex, Result<bool, TaskError>, Instant, Duration);

/// Executes the graph below `root`. A task is dispatched as soon as all of its
/// dependencies have resolved, with at most as many tasks in flight as the
/// rayon pool has threads. After the first failure no new task is
/// dispatched; tasks already in flight finish, and the failure is returned
/// attributed to the path from `root`.
///
/// Work closures run on scoped threads outside the pool. A closure may block
/// on a task that another graph is running, and it may use the pool for its
/// own parallel work; neither can park a pool worker underneath a closure.
pub(crate) fn run(root: &Task) -> Result<Diagnostics, TaskError> {
    let plan = Plan::collect(root);

    if let Err(cycle) = petgraph::algo::toposort(&plan.graph, None) {
        return Err(TaskError::Cycle {
            task: plan.graph[cycle.node_id()].name().to_string(),
        });
    }

    let pending: HashSet<NodeIndex> = plan
        .graph
        .node_indices()
        .filter(|&index| !plan.graph[index].resolved())
        .collect();

    let mut diagnostics = Diagnostics::new(&plan.graph);

    if pending.is_empty() {
        return Ok(diagnostics);
    }

    // A dependency only counts if it still has to run.
    let mut dependency_counts: HashMap<NodeIndex, usize> = pending
        .iter()
        .map(|&index| {
            let count = plan
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter(|dep| pending.contains(dep))
                .count();
            (index, count)
        })
        .collect();

    let total = pending.len() as u64;
    let limit = rayon::current_num_threads().max(1);

    let root_span = tracing::span!(Level::INFO, "graph", task = root.name());
    root_span.pb_set_length(total);
    if let Ok(style) = crate::utils::get_style_graph() {
        root_span.pb_set_style(&style);
    }
    root_span.pb_set_message(&format!("Building {}", root.name()));
    let _enter = root_span.enter();

    let task_style = crate::utils::get_style_task().ok();
    let mut failure: Option<(NodeIndex, TaskError)> = None;

    std::thread::scope(|s| {
        let (sender, receiver) = channel::<Message>();
        let mut ready: VecDeque<NodeIndex> = pending
            .iter()
            .copied()
            .filter(|index| dependency_counts.get(index).copied().unwrap_or(0) == 0)
            .collect();
        let mut in_flight = 0usize;

        let spawn = |index: NodeIndex| {
            let task = plan.graph[index].clone();
            let sender = sender.clone();
            let style = task_style.clone();
            let parent = root_span.clone();

            s.spawn(move || {
                let span = tracing::span!(parent: &parent, Level::INFO, "task", name = task.name());
                if let Some(style) = style {
                    span.pb_set_style(&style);
                }
                span.pb_set_message(task.name());
                let _enter = span.enter();

                let start = Instant::now();
                let result = task.run_local().map(|(_, ran)| ran);

                // the receiver outlives every spawned thread
                let _ = sender.send((index, result, start, start.elapsed()));
            });
        };

        loop {
            while in_flight < limit && failure.is_none() {
                let Some(index) = ready.pop_front() else {
                    break;
                };
                spawn(index);
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let (index, result, start, duration) = receive(&receiver);
            in_flight -= 1;
            root_span.pb_inc(1);

            match result {
                Ok(ran) => {
                    if ran {
                        diagnostics
                            .execution_times
                            .insert(index, TaskExecution { start, duration });
                    }

                    for dependent in plan.graph.neighbors_directed(index, Direction::Outgoing) {
                        if let Some(count) = dependency_counts.get_mut(&dependent) {
                            *count -= 1;
                            if *count == 0 {
                                ready.push_back(dependent);
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::error!("{}", err);
                    if failure.is_none() {
                        failure = Some((index, err));
                    }
                }
            }
        }
    });

    match failure {
        Some((index, err)) => Err(plan.attribute(index, err)),
        None => Ok(diagnostics),
    }
}

/// Waits for the next finished task. On a pool worker the current thread
/// helps with pending pool jobs while it waits, so closures that use the pool
/// still make progress when the caller holds its only worker.
fn receive(receiver: &std::sync::mpsc::Receiver<Message>) -> Message {
    loop {
        if let Ok(message) = receiver.try_recv() {
            return message;
        }

        match rayon::yield_now() {
            Some(rayon::Yield::Executed) => continue,
            _ => {
                if let Ok(message) = receiver.recv_timeout(Duration::from_millis(10)) {
                    return message;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn leaf(name: &'static str) -> Task {
        Task::builder(name).run(move || Ok(Utf8PathBuf::from(name)))
    }

    #[test]
    fn test_shared_dependency_is_one_node() {
        let a = leaf("a");
        let b = Task::builder("b").depends_on(&a).run(|| Ok("b".into()));
        let c = Task::builder("c").depends_on(&a).run(|| Ok("c".into()));
        let d = Task::builder("d")
            .depends_on(&b)
            .depends_on(&c)
            .depends_on(&a)
            .run(|| Ok("d".into()));

        let plan = Plan::collect(&d);
        assert_eq!(plan.graph.node_count(), 4);
        assert_eq!(plan.graph.edge_count(), 5);
    }

    #[test]
    fn test_resolved_tasks_are_leaves() {
        let a = leaf("a");
        let b = Task::builder("b").depends_on(&a).run(|| Ok("b".into()));
        b.execute().unwrap();

        let c = Task::builder("c").depends_on(&b).run(|| Ok("c".into()));
        let plan = Plan::collect(&c);
        assert_eq!(plan.graph.node_count(), 2);
    }

    #[test]
    fn test_cycle_is_rejected() {
        use std::sync::{Arc, Mutex};

        let slot: Arc<Mutex<Option<Task>>> = Arc::default();
        let lookup = slot.clone();

        let a = Task::builder("a")
            .depends_on_deferred(move || lookup.lock().unwrap().clone())
            .run(|| Ok("a".into()));
        let b = Task::builder("b").depends_on(&a).run(|| Ok("b".into()));
        *slot.lock().unwrap() = Some(b.clone());

        assert!(matches!(b.execute(), Err(TaskError::Cycle { .. })));
        assert!(!a.resolved());
    }

    #[test]
    fn test_diagnostics_report_only_what_ran() {
        let a = leaf("a");
        a.execute().unwrap();

        let b = Task::builder("b").depends_on(&a).run(|| Ok("b".into()));
        let (_, diagnostics) = b.execute_with_diagnostics().unwrap();
        assert_eq!(diagnostics.execution_times.len(), 1);

        let (_, again) = b.execute_with_diagnostics().unwrap();
        assert!(again.execution_times.is_empty());
    }

    #[test]
    fn test_wide_graph_on_small_pool() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

        let leaves: Vec<Task> = (0..16)
            .map(|i| Task::builder(format!("leaf{i}")).run(move || Ok(format!("/{i}").into())))
            .collect();
        let root = Task::builder("root")
            .depends_on_all(&leaves)
            .run(|| Ok("/root".into()));

        let path = pool.install(|| root.execute()).unwrap();
        assert_eq!(path, "/root");
        assert!(leaves.iter().all(Task::resolved));
    }
}
