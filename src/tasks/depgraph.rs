//! Task-level dependency graph.
//!
//! Turns the tracker's conflict sets into a DAG of ordering edges:
//! * both write: ordered by node execution index, then bundle index, and
//!   the edge is marked write-write,
//! * one writes, one reads: writer before reader. A reader whose node sits
//!   strictly earlier in the execution order is a design error
//!   (read-before-write) and is reported.
//!
//! Cycles cannot exist by construction; an insertion that would close one
//! is a hard error and the schedule refuses to build.

use fxhash::{FxHashMap, FxHashSet};

use crate::error::{GraphError, GraphResult};
use crate::graph::NodeId;
use crate::resource::ResourceId;
use crate::tasks::tracker::AccessTracker;
use crate::tasks::VirtualTaskId;

/// An ordering constraint: `from` must complete before `to` for execution
/// correctness, not as a mere preference.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskDependencyEdge {
    pub from: VirtualTaskId,
    pub to: VirtualTaskId,
    pub resource: ResourceId,
    pub is_write_write: bool,
}

#[derive(Default)]
pub struct TaskDependencyGraph {
    /// task -> tasks it depends on (incoming).
    dependencies: FxHashMap<VirtualTaskId, Vec<VirtualTaskId>>,
    /// task -> tasks depending on it (outgoing).
    dependents: FxHashMap<VirtualTaskId, Vec<VirtualTaskId>>,
    edges: Vec<TaskDependencyEdge>,
    edge_keys: FxHashSet<(VirtualTaskId, VirtualTaskId)>,
    all_tasks: Vec<VirtualTaskId>,
    /// Node execution indices captured at build time, for deterministic
    /// ordering decisions.
    order_index: FxHashMap<NodeId, usize>,
    /// Readers that precede their writer in the node execution order.
    read_before_write: Vec<TaskDependencyEdge>,
}

impl TaskDependencyGraph {
    pub fn new() -> TaskDependencyGraph {
        TaskDependencyGraph::default()
    }

    //---------------------------------------------------------------------
    // Building

    /// Build from the tracker's access sets. `execution_order` is the node
    /// order produced by the graph's topological sort; it resolves
    /// write-write conflicts deterministically.
    pub fn build(
        &mut self,
        tracker: &AccessTracker,
        execution_order: &[NodeId],
    ) -> GraphResult<()> {
        self.clear();
        self.order_index = execution_order
            .iter()
            .enumerate()
            .map(|(i, &n)| (n, i))
            .collect();
        self.all_tasks = tracker.all_tasks();

        // Deterministic resource iteration: sort by id.
        let mut resources: Vec<(ResourceId, &super::tracker::ResourceAccessInfo)> =
            tracker.resource_accesses().collect();
        resources.sort_by_key(|(id, _)| *id);

        for (resource, info) in resources {
            let mut writers = info.writers();
            let readers = info.readers();
            writers.sort_by_key(|t| self.task_sort_key(*t));

            // Write-write: order by execution index, tie-break by bundle.
            for pair in writers.windows(2) {
                self.add_edge(pair[0], pair[1], resource, true)?;
            }

            // Writer before reader, regardless of node order. A reader
            // scheduled earlier than the writer is reported as
            // read-before-write.
            for &writer in &writers {
                for &reader in &readers {
                    if reader == writer {
                        continue;
                    }
                    // A reader that also writes was ordered above.
                    if writers.contains(&reader) {
                        continue;
                    }
                    if self.node_order(reader.node) < self.node_order(writer.node) {
                        self.read_before_write.push(TaskDependencyEdge {
                            from: writer,
                            to: reader,
                            resource,
                            is_write_write: false,
                        });
                        log::warn!(
                            "read-before-write on resource {:?}: task {:?} reads before writer {:?}",
                            resource,
                            reader,
                            writer
                        );
                    }
                    self.add_edge(writer, reader, resource, false)?;
                }
            }
        }
        Ok(())
    }

    fn task_sort_key(&self, task: VirtualTaskId) -> (usize, u32) {
        (self.node_order(task.node), task.bundle)
    }

    fn node_order(&self, node: NodeId) -> usize {
        self.order_index.get(&node).copied().unwrap_or(usize::MAX)
    }

    fn add_edge(
        &mut self,
        from: VirtualTaskId,
        to: VirtualTaskId,
        resource: ResourceId,
        is_write_write: bool,
    ) -> GraphResult<()> {
        if from == to || self.edge_keys.contains(&(from, to)) {
            return Ok(());
        }
        if self.would_create_cycle(from, to) {
            return Err(GraphError::TaskCycle);
        }
        self.edge_keys.insert((from, to));
        self.edges.push(TaskDependencyEdge {
            from,
            to,
            resource,
            is_write_write,
        });
        self.dependencies.entry(to).or_default().push(from);
        self.dependents.entry(from).or_default().push(to);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.dependencies.clear();
        self.dependents.clear();
        self.edges.clear();
        self.edge_keys.clear();
        self.all_tasks.clear();
        self.order_index.clear();
        self.read_before_write.clear();
    }

    //---------------------------------------------------------------------
    // Queries

    pub fn dependencies_of(&self, task: VirtualTaskId) -> &[VirtualTaskId] {
        self.dependencies.get(&task).map_or(&[], |v| v.as_slice())
    }

    pub fn dependents_of(&self, task: VirtualTaskId) -> &[VirtualTaskId] {
        self.dependents.get(&task).map_or(&[], |v| v.as_slice())
    }

    pub fn dependency_count(&self, task: VirtualTaskId) -> usize {
        self.dependencies_of(task).len()
    }

    pub fn dependent_count(&self, task: VirtualTaskId) -> usize {
        self.dependents_of(task).len()
    }

    /// True if there is a path `from -> ... -> to`.
    pub fn has_path(&self, from: VirtualTaskId, to: VirtualTaskId) -> bool {
        if from == to {
            return true;
        }
        let mut seen = FxHashSet::default();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            for &next in self.dependents_of(current) {
                if next == to {
                    return true;
                }
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }

    fn would_create_cycle(&self, from: VirtualTaskId, to: VirtualTaskId) -> bool {
        self.has_path(to, from)
    }

    /// Direct dependency `a -> b`.
    pub fn has_dependency(&self, a: VirtualTaskId, b: VirtualTaskId) -> bool {
        self.edge_keys.contains(&(a, b))
    }

    /// No path in either direction: the tasks may run concurrently.
    pub fn can_parallelize(&self, a: VirtualTaskId, b: VirtualTaskId) -> bool {
        a != b && !self.has_path(a, b) && !self.has_path(b, a)
    }

    pub fn edges(&self) -> &[TaskDependencyEdge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn task_count(&self) -> usize {
        self.all_tasks.len()
    }

    /// Write-read orderings that contradict the node execution order;
    /// design errors surfaced to the caller.
    pub fn read_before_write_reports(&self) -> &[TaskDependencyEdge] {
        &self.read_before_write
    }

    //---------------------------------------------------------------------
    // Ordering

    /// Kahn's algorithm with priority by node execution index for
    /// determinism.
    pub fn topological_sort(&self) -> Vec<VirtualTaskId> {
        let mut in_degree: FxHashMap<VirtualTaskId, usize> = self
            .all_tasks
            .iter()
            .map(|&t| (t, self.dependency_count(t)))
            .collect();

        let mut ready: Vec<VirtualTaskId> = self
            .all_tasks
            .iter()
            .copied()
            .filter(|t| in_degree[t] == 0)
            .collect();
        ready.sort_by_key(|&t| self.task_sort_key(t));

        let mut order = Vec::with_capacity(self.all_tasks.len());
        while !ready.is_empty() {
            // Take the lowest key first; `ready` stays sorted.
            let task = ready.remove(0);
            order.push(task);
            for &next in self.dependents_of(task) {
                let degree = in_degree.get_mut(&next).expect("dependent not tracked");
                *degree -= 1;
                if *degree == 0 {
                    let key = self.task_sort_key(next);
                    let pos = ready
                        .binary_search_by_key(&key, |&t| self.task_sort_key(t))
                        .unwrap_or_else(|p| p);
                    ready.insert(pos, next);
                }
            }
        }
        order
    }

    /// Tasks with no dependencies, ready to run immediately.
    pub fn ready_tasks(&self) -> Vec<VirtualTaskId> {
        let mut tasks: Vec<VirtualTaskId> = self
            .all_tasks
            .iter()
            .copied()
            .filter(|&t| self.dependency_count(t) == 0)
            .collect();
        tasks.sort_by_key(|&t| self.task_sort_key(t));
        tasks
    }

    /// Level assignment: level(v) = 1 + max(level(u)) over predecessors.
    /// Tasks in the same level have no path between them and may run
    /// concurrently.
    pub fn parallel_levels(&self) -> Vec<Vec<VirtualTaskId>> {
        let order = self.topological_sort();
        let mut level_of: FxHashMap<VirtualTaskId, usize> = FxHashMap::default();
        let mut levels: Vec<Vec<VirtualTaskId>> = Vec::new();

        for task in order {
            let level = self
                .dependencies_of(task)
                .iter()
                .map(|dep| level_of.get(dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(task, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(task);
        }
        levels
    }

    /// Longest dependency chain, in levels.
    pub fn critical_path_length(&self) -> usize {
        self.parallel_levels().len()
    }

    /// Width of the widest level.
    pub fn max_parallelism(&self) -> usize {
        self.parallel_levels()
            .iter()
            .map(|level| level.len())
            .max()
            .unwrap_or(0)
    }

    /// Should never return true; edges are cycle-checked on insertion.
    pub fn has_cycle(&self) -> bool {
        self.topological_sort().len() != self.all_tasks.len()
    }
}
