use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::engine::Task;

/// Timing of a single task that actually ran.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What one call to [`Task::execute_with_diagnostics`] did.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Names of every task in the requested graph. Edges point from a
    /// dependency to its dependent.
    pub graph: Graph<String, ()>,
    /// Tasks whose work closure ran during this call. Everything else in
    /// [`Diagnostics::graph`] was already resolved.
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
}

impl Diagnostics {
    pub(crate) fn new(graph: &Graph<Task, ()>) -> Self {
        Self {
            graph: graph.map(|_, task| task.name().to_string(), |_, _| ()),
            execution_times: HashMap::new(),
        }
    }

    /// Names of the tasks that ran, in start order.
    pub fn ran(&self) -> Vec<&str> {
        let mut ran: Vec<_> = self.execution_times.iter().collect();
        ran.sort_by_key(|(_, exec)| exec.start);
        ran.into_iter()
            .map(|(index, _)| self.graph[*index].as_str())
            .collect()
    }

    /// Total time spent in work closures.
    pub fn busy(&self) -> Duration {
        self.execution_times.values().map(|exec| exec.duration).sum()
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution
    /// duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (skipped)
    pub fn render_mermaid(&self) -> String {
        Mermaid(self).to_string()
    }
}

struct Mermaid<'a>(&'a Diagnostics);

impl Mermaid<'_> {
    fn bounds(&self) -> (f64, f64) {
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for exec in self.0.execution_times.values() {
            let secs = exec.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        (min_time, max_time)
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}

impl Display for Mermaid<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Diagnostics {
            graph,
            execution_times,
        } = self.0;
        let (min_time, max_time) = self.bounds();

        writeln!(f, "graph LR")?;

        for index in graph.node_indices() {
            let name = graph[index].replace('"', "\\\"");

            let (label, color) = match execution_times.get(&index) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("Cached".to_string(), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label)?;
            writeln!(f, "    style {} fill:{}", index.index(), color)?;
        }

        for edge in graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
