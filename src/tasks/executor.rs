//! Parallel virtual-task executor.
//!
//! Levels from the dependency graph run one after another with a hard
//! barrier in between; tasks inside a level are submitted to a work-stealing
//! pool. A failing task never aborts its level: siblings finish, the error
//! is recorded, and the phase reports failure.
//!
//! Nodes that opted out of parallelism get their tasks serialized into
//! dedicated levels of size one, inserted before the level they would have
//! shared.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{GraphError, GraphResult};
use crate::graph::NodeId;
use crate::profile::Sampler;
use crate::tasks::depgraph::TaskDependencyGraph;
use crate::tasks::tracker::AccessTracker;
use crate::tasks::{TaskPhase, VirtualTaskId};

/// Error recorded for one failed task.
#[derive(Clone, Debug)]
pub struct VirtualTaskError {
    pub task: VirtualTaskId,
    pub phase: TaskPhase,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExecutorStats {
    pub total_tasks: usize,
    pub parallel_tasks: usize,
    pub serialized_tasks: usize,
    pub failed_tasks: usize,
    pub level_count: usize,
    pub max_parallel_level: usize,
    pub critical_path_length: usize,
}

/// Callback executing one `(task, phase)` pair. Provided by the graph; the
/// executor owns scheduling only.
pub type PhaseRunner<'a> = &'a (dyn Fn(VirtualTaskId, TaskPhase) -> GraphResult<()> + Sync);

/// Profile lookup for a task, queried once per task per phase.
pub type ProfileLookup<'a> = &'a (dyn Fn(VirtualTaskId) -> Vec<crate::node::SharedProfile> + Sync);

pub struct TaskExecutor {
    pool: Option<rayon::ThreadPool>,
    dep_graph: TaskDependencyGraph,
    levels: Vec<Vec<VirtualTaskId>>,
    errors: Mutex<Vec<VirtualTaskError>>,
    cancel: AtomicBool,
    failed_count: AtomicUsize,
    stats: Mutex<ExecutorStats>,
    built: bool,
    enabled: bool,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        TaskExecutor::new(0)
    }
}

impl TaskExecutor {
    /// `threads == 0` sizes the pool to the hardware concurrency.
    pub fn new(threads: usize) -> TaskExecutor {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("graph-task-{i}"))
            .build()
            .ok();
        if pool.is_none() {
            log::warn!("task pool unavailable, falling back to the global pool");
        }
        TaskExecutor {
            pool,
            dep_graph: TaskDependencyGraph::new(),
            levels: Vec::new(),
            errors: Mutex::new(Vec::new()),
            cancel: AtomicBool::new(false),
            failed_count: AtomicUsize::new(0),
            stats: Mutex::new(ExecutorStats::default()),
            built: false,
            enabled: true,
        }
    }

    //---------------------------------------------------------------------
    // Building

    /// Build the schedule from the tracker and node execution order.
    /// `serial_nodes` lists nodes that opted out of parallel scheduling.
    pub fn build(
        &mut self,
        tracker: &AccessTracker,
        execution_order: &[NodeId],
        serial_nodes: &[NodeId],
    ) -> GraphResult<()> {
        self.dep_graph.build(tracker, execution_order)?;
        if self.dep_graph.has_cycle() {
            return Err(GraphError::TaskCycle);
        }

        let raw_levels = self.dep_graph.parallel_levels();
        self.levels = split_serial_tasks(raw_levels, serial_nodes);
        self.built = true;

        let mut stats = self.stats.lock();
        stats.total_tasks = self.dep_graph.task_count();
        stats.level_count = self.levels.len();
        stats.max_parallel_level = self.levels.iter().map(|l| l.len()).max().unwrap_or(0);
        stats.critical_path_length = self.dep_graph.critical_path_length();
        stats.parallel_tasks = self
            .levels
            .iter()
            .filter(|l| l.len() > 1)
            .map(|l| l.len())
            .sum();
        stats.serialized_tasks = stats.total_tasks - stats.parallel_tasks;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.dep_graph.clear();
        self.levels.clear();
        self.errors.lock().clear();
        self.failed_count.store(0, Ordering::Relaxed);
        self.built = false;
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling parallel execution runs every level sequentially on the
    /// caller's thread. Scheduling order is unchanged.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn dependency_graph(&self) -> &TaskDependencyGraph {
        &self.dep_graph
    }

    pub fn parallel_levels(&self) -> &[Vec<VirtualTaskId>] {
        &self.levels
    }

    //---------------------------------------------------------------------
    // Execution

    /// Run every task of one phase, level by level. Returns false when any
    /// task failed; per-task errors are collected via `errors()`.
    pub fn execute_phase(
        &self,
        phase: TaskPhase,
        runner: PhaseRunner,
        profiles: ProfileLookup,
    ) -> bool {
        if !self.built {
            return true;
        }
        self.cancel.store(false, Ordering::Relaxed);
        let before = self.failed_count.load(Ordering::Relaxed);

        for level in &self.levels {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            self.execute_level(level, phase, runner, profiles);
            // Hard barrier between levels: execute_level only returns once
            // every task in it has finished.
        }

        let failed = self.failed_count.load(Ordering::Relaxed) - before;
        if failed > 0 {
            self.stats.lock().failed_tasks += failed;
        }
        failed == 0
    }

    /// Convenience: run all four phases in order, stopping early only on
    /// cancellation. Returns true if every phase succeeded.
    pub fn execute_all_phases(&self, runner: PhaseRunner, profiles: ProfileLookup) -> bool {
        let mut ok = true;
        for phase in TaskPhase::ALL {
            ok &= self.execute_phase(phase, runner, profiles);
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
        }
        ok
    }

    fn execute_level(
        &self,
        level: &[VirtualTaskId],
        phase: TaskPhase,
        runner: PhaseRunner,
        profiles: ProfileLookup,
    ) {
        if level.len() == 1 || !self.enabled {
            for &task in level {
                if self.cancel.load(Ordering::Relaxed) {
                    return;
                }
                self.execute_task(task, phase, runner, profiles);
            }
            return;
        }

        match &self.pool {
            Some(pool) => pool.install(|| {
                level.par_iter().for_each(|&task| {
                    if !self.cancel.load(Ordering::Relaxed) {
                        self.execute_task(task, phase, runner, profiles);
                    }
                });
            }),
            None => {
                level.par_iter().for_each(|&task| {
                    if !self.cancel.load(Ordering::Relaxed) {
                        self.execute_task(task, phase, runner, profiles);
                    }
                });
            }
        }
    }

    fn execute_task(
        &self,
        task: VirtualTaskId,
        phase: TaskPhase,
        runner: PhaseRunner,
        profiles: ProfileLookup,
    ) {
        // Profiles sample the execute phase only; compile-time cost is not
        // part of the frame budget.
        let samplers: Vec<Sampler> = if phase == TaskPhase::Execute {
            profiles(task).into_iter().map(Sampler::new).collect()
        } else {
            Vec::new()
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| runner(task, phase)));
        drop(samplers);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.record_error(task, phase, err.to_string()),
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("task panicked")
                };
                self.record_error(task, phase, message);
            }
        }
    }

    fn record_error(&self, task: VirtualTaskId, phase: TaskPhase, message: String) {
        log::error!("task {:?} failed in {}: {}", task, phase.name(), message);
        self.failed_count.fetch_add(1, Ordering::Relaxed);
        self.errors.lock().push(VirtualTaskError {
            task,
            phase,
            message,
        });
    }

    /// Cooperative cancellation, polled between tasks.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    //---------------------------------------------------------------------
    // Errors and statistics

    pub fn errors(&self) -> Vec<VirtualTaskError> {
        self.errors.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    pub fn clear_errors(&self) {
        self.errors.lock().clear();
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = ExecutorStats::default();
    }
}

/// Pull tasks of serial nodes out into their own single-task levels,
/// inserted before the level they would have co-occupied.
fn split_serial_tasks(
    levels: Vec<Vec<VirtualTaskId>>,
    serial_nodes: &[NodeId],
) -> Vec<Vec<VirtualTaskId>> {
    if serial_nodes.is_empty() {
        return levels;
    }
    let mut out = Vec::with_capacity(levels.len());
    for level in levels {
        let (serial, parallel): (Vec<VirtualTaskId>, Vec<VirtualTaskId>) = level
            .into_iter()
            .partition(|t| serial_nodes.contains(&t.node));
        for task in serial {
            out.push(vec![task]);
        }
        if !parallel.is_empty() {
            out.push(parallel);
        }
    }
    out
}

//--------------------------------------------------------------------------------------------------
