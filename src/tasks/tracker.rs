//! Per-task resource access tracking.
//!
//! Records, for every resource, which virtual tasks read or write it. The
//! dependency graph turns these access sets into ordering edges.
//!
//! Conflict rules:
//! * writer + writer on the same resource: conflict
//! * writer + reader on the same resource: conflict
//! * reader + reader: no conflict

use fxhash::{FxHashMap, FxHashSet};

use crate::graph::NodeId;
use crate::node::NodeInstance;
use crate::resource::ResourceId;
use crate::slots::SlotMutability;
use crate::tasks::VirtualTaskId;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceAccessType {
    Read,
    Write,
    ReadWrite,
}

impl ResourceAccessType {
    pub fn writes(self) -> bool {
        matches!(self, ResourceAccessType::Write | ResourceAccessType::ReadWrite)
    }

    pub fn reads(self) -> bool {
        matches!(self, ResourceAccessType::Read | ResourceAccessType::ReadWrite)
    }
}

/// One task's access to one resource.
#[derive(Copy, Clone, Debug)]
pub struct ResourceAccess {
    pub task: VirtualTaskId,
    pub access_type: ResourceAccessType,
    pub slot_index: u32,
    pub is_output: bool,
}

/// All accesses recorded against one resource.
#[derive(Clone, Debug, Default)]
pub struct ResourceAccessInfo {
    pub accesses: Vec<ResourceAccess>,
}

impl ResourceAccessInfo {
    pub fn writers(&self) -> Vec<VirtualTaskId> {
        let mut writers: Vec<VirtualTaskId> = self
            .accesses
            .iter()
            .filter(|a| a.access_type.writes())
            .map(|a| a.task)
            .collect();
        writers.dedup();
        writers
    }

    pub fn readers(&self) -> Vec<VirtualTaskId> {
        let mut readers: Vec<VirtualTaskId> = self
            .accesses
            .iter()
            .filter(|a| a.access_type.reads())
            .map(|a| a.task)
            .collect();
        readers.dedup();
        readers
    }

    pub fn has_writer(&self) -> bool {
        self.accesses.iter().any(|a| a.access_type.writes())
    }

    pub fn has_multiple_writers(&self) -> bool {
        self.writers().len() > 1
    }

    pub fn writer_count(&self) -> usize {
        self.writers().len()
    }

    pub fn reader_count(&self) -> usize {
        self.readers().len()
    }
}

//--------------------------------------------------------------------------------------------------

/// Tracks resource access at `(node, bundle)` granularity.
///
/// Build once after compilation, query from a single thread.
#[derive(Default)]
pub struct AccessTracker {
    resource_accesses: FxHashMap<ResourceId, ResourceAccessInfo>,
    task_resources: FxHashMap<VirtualTaskId, Vec<ResourceId>>,
    task_writes: FxHashMap<VirtualTaskId, FxHashSet<ResourceId>>,
    task_reads: FxHashMap<VirtualTaskId, FxHashSet<ResourceId>>,
    node_tasks: FxHashMap<NodeId, Vec<VirtualTaskId>>,
}

impl AccessTracker {
    pub fn new() -> AccessTracker {
        AccessTracker::default()
    }

    /// Record one node's bundles. Called for every node in the execution
    /// order during schedule building.
    pub fn add_node(&mut self, id: NodeId, node: &NodeInstance) {
        let schema = node.schema();
        for (bundle_index, bundle) in node.bundles().iter().enumerate() {
            let task = VirtualTaskId::new(id, bundle_index as u32);
            self.node_tasks.entry(id).or_default().push(task);
            // Every task is tracked even when it touches nothing; the
            // executor still has to schedule it.
            self.task_resources.entry(task).or_default();

            for &slot in &bundle.read_slots {
                let Some(desc) = schema.input(slot) else { continue };
                let access_type = match desc.mutability {
                    SlotMutability::ReadOnly => ResourceAccessType::Read,
                    SlotMutability::ReadWrite => ResourceAccessType::ReadWrite,
                    // A write-only input slot would be a schema bug; treat
                    // it as a write for safety.
                    SlotMutability::WriteOnly => ResourceAccessType::Write,
                };
                for &resource in node.input_bindings(slot) {
                    self.record_access(resource, task, access_type, slot, false);
                }
            }

            for &slot in &bundle.write_slots {
                let Some(desc) = schema.output(slot) else { continue };
                let access_type = match desc.mutability {
                    SlotMutability::ReadWrite => ResourceAccessType::ReadWrite,
                    _ => ResourceAccessType::Write,
                };
                for &resource in node.output_bindings(slot) {
                    self.record_access(resource, task, access_type, slot, true);
                }
            }
        }
    }

    fn record_access(
        &mut self,
        resource: ResourceId,
        task: VirtualTaskId,
        access_type: ResourceAccessType,
        slot_index: u32,
        is_output: bool,
    ) {
        self.resource_accesses
            .entry(resource)
            .or_default()
            .accesses
            .push(ResourceAccess {
                task,
                access_type,
                slot_index,
                is_output,
            });

        self.task_resources.entry(task).or_default().push(resource);
        if access_type.writes() {
            self.task_writes.entry(task).or_default().insert(resource);
        }
        if access_type.reads() {
            self.task_reads.entry(task).or_default().insert(resource);
        }
    }

    pub fn clear(&mut self) {
        self.resource_accesses.clear();
        self.task_resources.clear();
        self.task_writes.clear();
        self.task_reads.clear();
        self.node_tasks.clear();
    }

    //---------------------------------------------------------------------
    // Conflict detection

    /// True if the two tasks share a resource where at least one access is a
    /// write.
    pub fn has_conflict(&self, a: VirtualTaskId, b: VirtualTaskId) -> bool {
        let empty = FxHashSet::default();
        let a_writes = self.task_writes.get(&a).unwrap_or(&empty);
        let b_writes = self.task_writes.get(&b).unwrap_or(&empty);
        let a_reads = self.task_reads.get(&a).unwrap_or(&empty);
        let b_reads = self.task_reads.get(&b).unwrap_or(&empty);

        a_writes.iter().any(|r| b_writes.contains(r) || b_reads.contains(r))
            || b_writes.iter().any(|r| a_reads.contains(r))
    }

    pub fn conflicting_tasks(&self, task: VirtualTaskId) -> FxHashSet<VirtualTaskId> {
        let mut out = FxHashSet::default();
        let Some(resources) = self.task_resources.get(&task) else {
            return out;
        };
        for resource in resources {
            if let Some(info) = self.resource_accesses.get(resource) {
                for access in &info.accesses {
                    if access.task != task && self.has_conflict(task, access.task) {
                        out.insert(access.task);
                    }
                }
            }
        }
        out
    }

    pub fn shared_resources(&self, a: VirtualTaskId, b: VirtualTaskId) -> Vec<ResourceId> {
        let Some(a_resources) = self.task_resources.get(&a) else {
            return Vec::new();
        };
        let b_resources: FxHashSet<ResourceId> = self
            .task_resources
            .get(&b)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default();
        let mut shared: Vec<ResourceId> = a_resources
            .iter()
            .copied()
            .filter(|r| b_resources.contains(r))
            .collect();
        shared.dedup();
        shared
    }

    /// Conflict between two bundles of the same node.
    pub fn has_intra_node_conflict(&self, node: NodeId, bundle_a: u32, bundle_b: u32) -> bool {
        self.has_conflict(
            VirtualTaskId::new(node, bundle_a),
            VirtualTaskId::new(node, bundle_b),
        )
    }

    //---------------------------------------------------------------------
    // Queries

    pub fn access_info(&self, resource: ResourceId) -> Option<&ResourceAccessInfo> {
        self.resource_accesses.get(&resource)
    }

    pub fn resource_accesses(
        &self,
    ) -> impl Iterator<Item = (ResourceId, &ResourceAccessInfo)> + '_ {
        self.resource_accesses.iter().map(|(&id, info)| (id, info))
    }

    pub fn task_resources(&self, task: VirtualTaskId) -> Vec<ResourceId> {
        self.task_resources.get(&task).cloned().unwrap_or_default()
    }

    pub fn task_writes(&self, task: VirtualTaskId) -> Vec<ResourceId> {
        let mut out: Vec<ResourceId> = self
            .task_writes
            .get(&task)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn task_reads(&self, task: VirtualTaskId) -> Vec<ResourceId> {
        let mut out: Vec<ResourceId> = self
            .task_reads
            .get(&task)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn is_writer(&self, task: VirtualTaskId) -> bool {
        self.task_writes
            .get(&task)
            .is_some_and(|writes| !writes.is_empty())
    }

    pub fn node_tasks(&self, node: NodeId) -> &[VirtualTaskId] {
        self.node_tasks
            .get(&node)
            .map_or(&[], |tasks| tasks.as_slice())
    }

    pub fn node_task_count(&self, node: NodeId) -> u32 {
        self.node_tasks(node).len() as u32
    }

    pub fn all_tasks(&self) -> Vec<VirtualTaskId> {
        let mut tasks: Vec<VirtualTaskId> = self.task_resources.keys().copied().collect();
        tasks.sort();
        tasks
    }

    //---------------------------------------------------------------------
    // Statistics

    pub fn resource_count(&self) -> usize {
        self.resource_accesses.len()
    }

    pub fn task_count(&self) -> usize {
        self.task_resources.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_tasks.len()
    }

    pub fn conflicting_resource_count(&self) -> usize {
        self.resource_accesses
            .values()
            .filter(|info| {
                info.has_multiple_writers()
                    || (info.has_writer() && info.reader_count() > 0)
            })
            .count()
    }

    pub fn max_writers_per_resource(&self) -> usize {
        self.resource_accesses
            .values()
            .map(|info| info.writer_count())
            .max()
            .unwrap_or(0)
    }

    /// Rough estimate of schedulable parallelism: the share of task pairs
    /// without conflicts. 1.0 means fully parallel.
    pub fn parallelism_potential(&self) -> f32 {
        let tasks = self.all_tasks();
        if tasks.len() < 2 {
            return 1.0;
        }
        let mut pairs = 0usize;
        let mut conflict_free = 0usize;
        for i in 0..tasks.len() {
            for j in (i + 1)..tasks.len() {
                pairs += 1;
                if !self.has_conflict(tasks[i], tasks[j]) {
                    conflict_free += 1;
                }
            }
        }
        conflict_free as f32 / pairs as f32
    }
}
