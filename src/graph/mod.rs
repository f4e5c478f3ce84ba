//! The render graph orchestrator.
//!
//! Owns the node arena, the resource arena, the topology and the schedule.
//! The per-frame loop is:
//! 1. `process_events` drains the bus; handlers queue invalidations which
//!    mark subtrees dirty (resize, shader reload), never tear down.
//! 2. `recompile_dirty_nodes` re-runs compile for dirty subtrees only.
//! 3. `update_time` advances the loop manager.
//! 4. the executor runs the Execute phase level by level.
//!
//! Compilation validates, orders, allocates, then drives Setup and Compile
//! through the same executor with phase barriers.

mod cleanup;
mod loops;

pub use self::cleanup::{CleanupHandle, CleanupStack};
pub use self::loops::{
    FrameTimer, LoopCatchupMode, LoopConfig, LoopManager, LoopReference,
};

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use slotmap::{new_key_type, Key, SlotMap};

use crate::error::{GraphError, GraphResult};
use crate::events::{
    CleanupCompletedMessage, CleanupRequestedMessage, MessageBus, SenderId,
    ShaderReloadedMessage, ShutdownAckMessage, SubscriptionId, WindowCloseRequestedMessage,
    WindowResizedMessage,
};
use crate::interop::DeviceCache;
use crate::logger::Logger;
use crate::node::{Node, NodeCtx, NodeInstance, NodeState, ParamValue, SharedProfile};
use crate::profile::{CapacityTracker, TaskProfileRegistry};
use crate::registry::{NodeTypeId, NodeTypeRegistry};
use crate::resource::{Resource, ResourceArena, ResourceId, TypeTag};
use crate::settings::GraphSettings;
use crate::slots::{SlotArrayMode, SlotDesc};
use crate::tasks::{
    AccessTracker, TaskExecutor, TaskPhase, VirtualTaskError, VirtualTaskId,
};
use crate::topology::{ConnectionBatch, GraphEdge, GraphTopology, PendingConnection};

new_key_type! {
    /// Stable handle to a node added to the graph.
    pub struct NodeId;
}

impl CleanupHandle {
    /// Cleanup entries are usually keyed by the owning node.
    pub fn from_node(node: NodeId) -> CleanupHandle {
        CleanupHandle(node.data().as_ffi())
    }
}

/// Outcome of one `render_frame` call. A failed frame leaves the graph
/// usable for the next one.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub frame_index: u64,
    pub success: bool,
    pub task_errors: Vec<VirtualTaskError>,
    pub recompiled_nodes: usize,
}

/// Invalidations queued by bus handlers, drained on the main thread.
#[derive(Default)]
struct PendingInvalidations {
    resized: Option<(u32, u32)>,
    shaders: Vec<String>,
    cleanup_requests: Vec<u32>,
    close_requested: bool,
    shutdown_acks: Vec<String>,
}

pub struct RenderGraph {
    registry: Arc<NodeTypeRegistry>,
    bus: Arc<MessageBus>,
    logger: Arc<Logger>,
    device: Option<Arc<dyn DeviceCache>>,
    settings: GraphSettings,

    nodes: SlotMap<NodeId, NodeInstance>,
    by_name: FxHashMap<String, NodeId>,
    by_type: FxHashMap<NodeTypeId, Vec<NodeId>>,
    resources: ResourceArena,
    topology: GraphTopology,

    loops: LoopManager,
    timer: FrameTimer,
    cleanup: Mutex<CleanupStack>,
    executor: TaskExecutor,
    profiles: TaskProfileRegistry,
    capacity_trackers: Vec<CapacityTracker>,

    execution_order: Vec<NodeId>,
    shader_watchers: FxHashMap<String, Vec<NodeId>>,
    resize_watchers: Vec<NodeId>,

    invalidations: Arc<Mutex<PendingInvalidations>>,
    subscriptions: Vec<SubscriptionId>,

    frame_index: u64,
    is_compiled: bool,
    shutdown_requested: bool,
    shutdown_acks: Vec<String>,
    sender_id: SenderId,
}

impl RenderGraph {
    pub fn new(
        registry: Arc<NodeTypeRegistry>,
        bus: Arc<MessageBus>,
        logger: Arc<Logger>,
        device: Option<Arc<dyn DeviceCache>>,
    ) -> RenderGraph {
        RenderGraph::with_settings(registry, bus, logger, device, GraphSettings::default())
    }

    pub fn with_settings(
        registry: Arc<NodeTypeRegistry>,
        bus: Arc<MessageBus>,
        logger: Arc<Logger>,
        device: Option<Arc<dyn DeviceCache>>,
        settings: GraphSettings,
    ) -> RenderGraph {
        let invalidations = Arc::new(Mutex::new(PendingInvalidations::default()));
        let mut subscriptions = Vec::new();

        {
            let queue = Arc::clone(&invalidations);
            subscriptions.push(bus.subscribe(WindowResizedMessage::TYPE, move |msg| {
                if let Some(resize) = msg.downcast_ref::<WindowResizedMessage>() {
                    queue.lock().resized = Some((resize.new_width, resize.new_height));
                }
                true
            }));
        }
        {
            let queue = Arc::clone(&invalidations);
            subscriptions.push(bus.subscribe(ShaderReloadedMessage::TYPE, move |msg| {
                if let Some(reload) = msg.downcast_ref::<ShaderReloadedMessage>() {
                    queue.lock().shaders.push(reload.shader_path.clone());
                }
                true
            }));
        }
        {
            let queue = Arc::clone(&invalidations);
            subscriptions.push(bus.subscribe(CleanupRequestedMessage::TYPE, move |msg| {
                if let Some(request) = msg.downcast_ref::<CleanupRequestedMessage>() {
                    queue.lock().cleanup_requests.push(request.request_id);
                }
                true
            }));
        }
        {
            let queue = Arc::clone(&invalidations);
            subscriptions.push(bus.subscribe(WindowCloseRequestedMessage::TYPE, move |_| {
                queue.lock().close_requested = true;
                true
            }));
        }
        {
            let queue = Arc::clone(&invalidations);
            subscriptions.push(bus.subscribe(ShutdownAckMessage::TYPE, move |msg| {
                if let Some(ack) = msg.downcast_ref::<ShutdownAckMessage>() {
                    queue.lock().shutdown_acks.push(ack.system_name.clone());
                }
                true
            }));
        }

        let mut profiles = TaskProfileRegistry::new();
        profiles.register_builtin_factories();

        logger.set_mirror_to_terminal(settings.mirror_logs);

        let mut executor = TaskExecutor::new(settings.executor_threads);
        executor.set_enabled(!settings.disable_parallel_execution);

        let mut loops = LoopManager::new();
        loops.set_drain_in_frame(
            settings.drain_loops_in_frame,
            settings.max_loop_steps_per_frame,
        );

        RenderGraph {
            executor,
            registry,
            bus,
            logger,
            device,
            settings,
            nodes: SlotMap::with_key(),
            by_name: FxHashMap::default(),
            by_type: FxHashMap::default(),
            resources: ResourceArena::new(),
            topology: GraphTopology::new(),
            loops,
            timer: FrameTimer::new(),
            cleanup: Mutex::new(CleanupStack::new()),
            profiles,
            capacity_trackers: Vec::new(),
            execution_order: Vec::new(),
            shader_watchers: FxHashMap::default(),
            resize_watchers: Vec::new(),
            invalidations,
            subscriptions,
            frame_index: 0,
            is_compiled: false,
            shutdown_requested: false,
            shutdown_acks: Vec::new(),
            sender_id: 1,
        }
    }

    //---------------------------------------------------------------------
    // Construction

    pub fn add_node(
        &mut self,
        type_name: &str,
        instance_name: &str,
    ) -> GraphResult<NodeId> {
        if self.by_name.contains_key(instance_name) {
            return Err(GraphError::DuplicateInstanceName(instance_name.to_string()));
        }
        let node_type = self
            .registry
            .get_by_name(type_name)
            .ok_or_else(|| GraphError::UnknownNodeType(type_name.to_string()))?;

        let type_id = node_type.type_id();
        let max = node_type.max_instances();
        if max > 0 {
            let current = self.by_type.get(&type_id).map_or(0, |v| v.len()) as u32;
            if current >= max {
                return Err(GraphError::MaxInstancesExceeded {
                    type_name: type_name.to_string(),
                    max,
                });
            }
        }

        let instance = node_type.create_instance(instance_name);
        self.logger.add_child(Arc::clone(instance.logger()));

        let id = self.nodes.insert(instance);
        self.by_name.insert(instance_name.to_string(), id);
        self.by_type.entry(type_id).or_default().push(id);
        self.topology.add_node(id);
        self.is_compiled = false;
        Ok(id)
    }

    pub fn remove_node(&mut self, id: NodeId) -> GraphResult<()> {
        let node = self.nodes.remove(id).ok_or(GraphError::InvalidNodeHandle)?;
        self.by_name.remove(node.name());
        if let Some(list) = self.by_type.get_mut(&node.type_id()) {
            list.retain(|&n| n != id);
        }
        self.topology.remove_node(id);
        self.resize_watchers.retain(|&n| n != id);
        for watchers in self.shader_watchers.values_mut() {
            watchers.retain(|&n| n != id);
        }
        self.is_compiled = false;
        Ok(())
    }

    /// Connect an output slot to an input slot. Type tags must match; the
    /// input slot's array mode controls arity.
    pub fn connect(
        &mut self,
        source: NodeId,
        source_output: u32,
        target: NodeId,
        target_input: u32,
    ) -> GraphResult<()> {
        self.validate_connection(source, source_output, target, target_input, 0)?;
        self.apply_connection(source, source_output, target, target_input)
    }

    /// Apply a batch atomically: every connection validates up front
    /// (including acyclicity of the combined edge set) or none is applied.
    pub fn register_batch(&mut self, batch: ConnectionBatch) -> GraphResult<()> {
        // Per-slot counts within the batch so arity checks see earlier
        // batch entries too.
        let mut batch_counts: FxHashMap<(NodeId, u32), usize> = FxHashMap::default();
        for pending in &batch.connections {
            let extra = batch_counts
                .get(&(pending.target, pending.target_input))
                .copied()
                .unwrap_or(0);
            self.validate_connection(
                pending.source,
                pending.source_output,
                pending.target,
                pending.target_input,
                extra,
            )?;
            *batch_counts
                .entry((pending.target, pending.target_input))
                .or_insert(0) += 1;
        }

        let new_edges: Vec<(NodeId, NodeId)> = batch
            .connections
            .iter()
            .map(|p| (p.source, p.target))
            .collect();
        if let Some(cycle_nodes) = self.batch_cycle(&new_edges) {
            return Err(GraphError::CycleDetected {
                nodes: cycle_nodes
                    .into_iter()
                    .map(|n| self.node_name(n))
                    .collect(),
            });
        }

        for PendingConnection {
            source,
            source_output,
            target,
            target_input,
        } in batch.connections
        {
            self.apply_connection(source, source_output, target, target_input)?;
        }
        Ok(())
    }

    fn batch_cycle(&self, new_edges: &[(NodeId, NodeId)]) -> Option<Vec<NodeId>> {
        use petgraph::graphmap::DiGraphMap;
        let mut trial: DiGraphMap<NodeId, ()> = DiGraphMap::new();
        for id in self.nodes.keys() {
            trial.add_node(id);
        }
        for edge in self.topology.edges() {
            trial.add_edge(edge.source, edge.target, ());
        }
        for &(source, target) in new_edges {
            trial.add_edge(source, target, ());
        }
        if petgraph::algo::is_cyclic_directed(&trial) {
            // Report every node on some cycle: nodes that reach themselves.
            let participants: Vec<NodeId> = trial
                .nodes()
                .filter(|&n| {
                    trial
                        .neighbors_directed(n, petgraph::Direction::Outgoing)
                        .any(|m| petgraph::algo::has_path_connecting(&trial, m, n, None))
                })
                .collect();
            Some(participants)
        } else {
            None
        }
    }

    fn validate_connection(
        &self,
        source: NodeId,
        source_output: u32,
        target: NodeId,
        target_input: u32,
        pending_same_slot: usize,
    ) -> GraphResult<()> {
        let source_node = self.nodes.get(source).ok_or(GraphError::InvalidNodeHandle)?;
        let target_node = self.nodes.get(target).ok_or(GraphError::InvalidNodeHandle)?;

        let out_desc = source_node.schema().output(source_output).ok_or(
            GraphError::InvalidSlotIndex {
                node: source_node.name().to_string(),
                kind: "output",
                index: source_output,
            },
        )?;
        let in_desc = target_node.schema().input(target_input).ok_or(
            GraphError::InvalidSlotIndex {
                node: target_node.name().to_string(),
                kind: "input",
                index: target_input,
            },
        )?;

        if out_desc.tag != in_desc.tag {
            return Err(GraphError::ConnectionTypeMismatch {
                source_node: source_node.name().to_string(),
                source_slot: out_desc.name.to_string(),
                source_tag: out_desc.tag,
                target: target_node.name().to_string(),
                target_slot: in_desc.name.to_string(),
                target_tag: in_desc.tag,
            });
        }

        let bound = target_node.input_bindings(target_input).len() + pending_same_slot;
        let arity_ok = match in_desc.array_mode {
            SlotArrayMode::Single => bound == 0,
            SlotArrayMode::Fixed(n) => bound < n as usize,
            SlotArrayMode::Variadic | SlotArrayMode::Accumulation => true,
        };
        if !arity_ok {
            return Err(GraphError::SlotAlreadyConnected {
                node: target_node.name().to_string(),
                slot: in_desc.name.to_string(),
            });
        }
        Ok(())
    }

    fn apply_connection(
        &mut self,
        source: NodeId,
        source_output: u32,
        target: NodeId,
        target_input: u32,
    ) -> GraphResult<()> {
        // Create or reuse the producer's output resource.
        let existing = self.nodes[source]
            .output_bindings(source_output)
            .first()
            .copied();
        let resource_id = match existing {
            Some(id) => id,
            None => {
                let desc = self.nodes[source]
                    .schema()
                    .output(source_output)
                    .expect("slot validated")
                    .clone();
                let id = self.create_resource(source, &desc);
                self.nodes[source].bind_output(source_output, id);
                id
            }
        };

        self.nodes[target].bind_input(target_input, resource_id);
        self.nodes[target].add_dependency(source);
        self.topology.add_edge(GraphEdge {
            source,
            source_output,
            target,
            target_input,
        });
        self.is_compiled = false;
        Ok(())
    }

    fn create_resource(&mut self, owner: NodeId, desc: &SlotDesc) -> ResourceId {
        let name = format!("{}.{}", self.nodes[owner].name(), desc.name);
        self.resources.insert(Resource::new(
            name,
            desc.tag,
            desc.lifetime,
            desc.description.clone(),
        ))
    }

    //---------------------------------------------------------------------
    // Parameters and profiles

    /// Set a node parameter. After compilation this marks the node dirty so
    /// the next frame recompiles it.
    pub fn set_param(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> GraphResult<()> {
        let instance = self.nodes.get_mut(node).ok_or(GraphError::InvalidNodeHandle)?;
        instance.set_param(name, value);
        if matches!(
            instance.state(),
            NodeState::Compiled | NodeState::Ready | NodeState::Complete
        ) {
            instance.set_state(NodeState::Dirty);
        }
        Ok(())
    }

    /// Typed access to a node's behavior, for node-specific setters.
    pub fn with_node<T: Node, R>(
        &self,
        node: NodeId,
        f: impl FnOnce(&mut T) -> R,
    ) -> GraphResult<R> {
        let instance = self.nodes.get(node).ok_or(GraphError::InvalidNodeHandle)?;
        let mut behavior = instance.behavior.lock();
        let concrete = behavior
            .downcast_mut::<T>()
            .ok_or(GraphError::InvalidNodeHandle)?;
        Ok(f(concrete))
    }

    pub fn attach_profile(
        &mut self,
        node: NodeId,
        bundle: u32,
        profile: SharedProfile,
    ) -> GraphResult<()> {
        let instance = self.nodes.get_mut(node).ok_or(GraphError::InvalidNodeHandle)?;
        instance.attach_profile(bundle, profile);
        Ok(())
    }

    pub fn profiles(&self) -> &TaskProfileRegistry {
        &self.profiles
    }

    pub fn profiles_mut(&mut self) -> &mut TaskProfileRegistry {
        &mut self.profiles
    }

    pub fn add_capacity_tracker(&mut self, tracker: CapacityTracker) {
        self.capacity_trackers.push(tracker);
    }

    /// Capacity tracker for one category using the settings' frame budget.
    pub fn add_capacity_tracker_for(&mut self, category: &str) {
        self.capacity_trackers.push(
            CapacityTracker::new(Some(category), self.settings.frame_budget_ns())
                .with_frames_before_increase(self.settings.frames_before_increase),
        );
    }

    /// Persist task-profile calibration to the configured path.
    pub fn save_profiles(&self) -> GraphResult<()> {
        self.profiles.save_to_file(&self.settings.profile_state_path)
    }

    /// Restore task-profile calibration from the configured path. A missing
    /// file is not an error; nothing else persists across runs.
    pub fn load_profiles(&mut self) -> GraphResult<usize> {
        let path = std::path::Path::new(&self.settings.profile_state_path);
        if !path.exists() {
            return Ok(0);
        }
        self.profiles.load_from_file(path)
    }

    //---------------------------------------------------------------------
    // Invalidation interest

    /// Mark `node` (and its subtree) dirty whenever the window resizes.
    pub fn watch_window_resize(&mut self, node: NodeId) {
        if !self.resize_watchers.contains(&node) {
            self.resize_watchers.push(node);
        }
    }

    /// Mark `node` (and its subtree) dirty whenever `path` hot-reloads.
    pub fn watch_shader(&mut self, node: NodeId, path: impl Into<String>) {
        let watchers = self.shader_watchers.entry(path.into()).or_default();
        if !watchers.contains(&node) {
            watchers.push(node);
        }
    }

    //---------------------------------------------------------------------
    // Queries

    pub fn node_id(&self, instance_name: &str) -> Option<NodeId> {
        self.by_name.get(instance_name).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInstance> {
        self.nodes.get(id)
    }

    pub fn node_state(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.state())
    }

    fn node_name(&self, id: NodeId) -> String {
        self.nodes
            .get(id)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| format!("{id:?}"))
    }

    pub fn instances_of_type(&self, type_id: NodeTypeId) -> Vec<NodeId> {
        self.by_type.get(&type_id).cloned().unwrap_or_default()
    }

    pub fn instance_count(&self, type_id: NodeTypeId) -> usize {
        self.by_type.get(&type_id).map_or(0, |v| v.len())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_compiled(&self) -> bool {
        self.is_compiled
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn resources(&self) -> &ResourceArena {
        &self.resources
    }

    /// Read the current value of a node's output resource.
    pub fn output_value<T: crate::resource::ResourceData>(
        &self,
        node: NodeId,
        slot: u32,
    ) -> GraphResult<T> {
        let instance = self.nodes.get(node).ok_or(GraphError::InvalidNodeHandle)?;
        let id = instance
            .output_bindings(slot)
            .first()
            .copied()
            .ok_or(GraphError::UnknownResource)?;
        self.resources.with_read(id, |r| r.get::<T>())?
    }

    //---------------------------------------------------------------------
    // Loops

    pub fn register_loop(&mut self, config: LoopConfig) -> u32 {
        self.loops.register_loop(config)
    }

    pub fn loop_reference(&self, loop_id: u32) -> GraphResult<&LoopReference> {
        self.loops.loop_reference(loop_id)
    }

    pub fn loop_manager(&self) -> &LoopManager {
        &self.loops
    }

    //---------------------------------------------------------------------
    // Cleanup stack

    /// Register a teardown closure, ordered before the entries it depends
    /// on. Typically called from node `compile` for externally-managed
    /// resources.
    pub fn register_cleanup(
        &self,
        handle: CleanupHandle,
        name: impl Into<String>,
        run: impl FnOnce() + Send + 'static,
        depends_on: Vec<CleanupHandle>,
    ) {
        self.cleanup.lock().register(handle, name, run, depends_on);
    }

    //---------------------------------------------------------------------
    // Validation

    pub fn validate(&self) -> GraphResult<()> {
        // Topology acyclic.
        if let Err(cycle) = self.topology.topological_sort() {
            return Err(GraphError::CycleDetected {
                nodes: cycle.into_iter().map(|n| self.node_name(n)).collect(),
            });
        }

        for node in self.nodes.values() {
            // Required inputs bound.
            for desc in &node.schema().inputs {
                if desc.is_required() && node.input_bindings(desc.index).is_empty() {
                    return Err(GraphError::MissingRequiredInput {
                        node: node.name().to_string(),
                        slot: desc.name.to_string(),
                    });
                }
            }
        }

        // Connection tags and image formats.
        for edge in self.topology.edges() {
            let source = &self.nodes[edge.source];
            let target = &self.nodes[edge.target];
            let out_desc = source.schema().output(edge.source_output).expect("edge slot");
            let in_desc = target.schema().input(edge.target_input).expect("edge slot");
            if out_desc.tag != in_desc.tag {
                return Err(GraphError::ConnectionTypeMismatch {
                    source_node: source.name().to_string(),
                    source_slot: out_desc.name.to_string(),
                    source_tag: out_desc.tag,
                    target: target.name().to_string(),
                    target_slot: in_desc.name.to_string(),
                    target_tag: in_desc.tag,
                });
            }

            // Image schema check: both formats stated means they must match.
            if let (Some(expected), Some(&resource)) = (
                in_desc.description.image(),
                source.output_bindings(edge.source_output).first(),
            ) {
                if !expected.format.is_empty() {
                    let actual = self
                        .resources
                        .with_read(resource, |r| {
                            r.descriptor().image().map(|d| d.format.clone())
                        })?
                        .unwrap_or_default();
                    if !actual.is_empty() && actual != expected.format {
                        return Err(GraphError::FormatMismatch {
                            node: target.name().to_string(),
                            slot: in_desc.name.to_string(),
                            expected: expected.format.clone(),
                            actual,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    //---------------------------------------------------------------------
    // Compilation

    pub fn compile(&mut self) -> GraphResult<()> {
        self.validate()?;

        // Execution order and indices.
        let order = self
            .topology
            .topological_sort()
            .map_err(|cycle| GraphError::CycleDetected {
                nodes: cycle.into_iter().map(|n| self.node_name(n)).collect(),
            })?;
        for (index, &id) in order.iter().enumerate() {
            self.nodes[id].set_execution_index(index as u32);
        }
        self.execution_order = order;

        // Allocate resources for outputs nothing connected to yet.
        self.allocate_resources();

        // Build the task schedule.
        self.rebuild_schedule()?;

        // Setup then Compile through the executor, with a barrier between.
        self.executor.clear_errors();
        let setup_ok = self.run_phase(TaskPhase::Setup);
        let compile_ok = setup_ok && self.run_phase(TaskPhase::Compile);

        self.propagate_compile_errors();

        if !compile_ok {
            let failed = self.executor.errors().len();
            return Err(GraphError::PhaseFailed {
                phase: if setup_ok {
                    TaskPhase::Compile
                } else {
                    TaskPhase::Setup
                },
                failed,
            });
        }

        self.is_compiled = true;
        log::info!(
            "graph compiled: {} nodes, {} levels, critical path {}",
            self.execution_order.len(),
            self.executor.stats().level_count,
            self.executor.stats().critical_path_length
        );
        Ok(())
    }

    fn allocate_resources(&mut self) {
        let ids: Vec<NodeId> = self.execution_order.clone();
        for id in ids {
            let missing: Vec<SlotDesc> = self.nodes[id]
                .schema()
                .outputs
                .iter()
                .filter(|desc| self.nodes[id].output_bindings(desc.index).is_empty())
                .cloned()
                .collect();
            for desc in missing {
                let resource = self.create_resource(id, &desc);
                self.nodes[id].bind_output(desc.index, resource);
            }
        }
    }

    fn rebuild_schedule(&mut self) -> GraphResult<()> {
        let mut tracker = AccessTracker::new();
        for &id in &self.execution_order {
            tracker.add_node(id, &self.nodes[id]);
        }
        let serial_nodes: Vec<NodeId> = self
            .execution_order
            .iter()
            .copied()
            .filter(|&id| !self.nodes[id].is_parallelizable())
            .collect();
        self.executor.clear();
        self.executor
            .build(&tracker, &self.execution_order, &serial_nodes)
    }

    fn run_phase(&self, phase: TaskPhase) -> bool {
        self.executor.execute_phase(
            phase,
            &|task, phase| self.run_task(task, phase),
            &|task| self.task_profiles(task),
        )
    }

    fn task_profiles(&self, task: VirtualTaskId) -> Vec<SharedProfile> {
        self.nodes
            .get(task.node)
            .map(|n| n.bundle_profiles(task.bundle).to_vec())
            .unwrap_or_default()
    }

    /// Execute one `(node, bundle)` pair for a phase. Called from executor
    /// worker threads; everything shared is behind locks.
    fn run_task(&self, task: VirtualTaskId, phase: TaskPhase) -> GraphResult<()> {
        let node = self
            .nodes
            .get(task.node)
            .ok_or(GraphError::InvalidNodeHandle)?;

        // Node-scope phases run once, on bundle 0; Execute runs per bundle.
        if phase != TaskPhase::Execute && task.bundle != 0 {
            return Ok(());
        }

        let ctx = NodeCtx {
            phase,
            bundle: task.bundle,
            node_id: task.node,
            node,
            resources: &self.resources,
            bus: &self.bus,
            loops: &self.loops,
            device: self.device.as_ref(),
            cleanup: &self.cleanup,
            frame_index: self.frame_index,
        };

        match phase {
            TaskPhase::Setup => {
                if node.state() != NodeState::Created {
                    return Ok(());
                }
                node.behavior.lock().setup(&ctx)?;
                node.set_state(NodeState::Setup);
                Ok(())
            }
            TaskPhase::Compile => {
                match node.state() {
                    NodeState::Setup | NodeState::Dirty | NodeState::Compiled => {}
                    // Error nodes retry only after an invalidation marks
                    // them dirty again.
                    _ => return Ok(()),
                }
                match node.behavior.lock().compile(&ctx) {
                    Ok(()) => {
                        node.set_state(NodeState::Compiled);
                        Ok(())
                    }
                    Err(err) => {
                        node.set_state(NodeState::Error);
                        node.logger().error(format!("compile failed: {err}"));
                        Err(GraphError::NodeCompileFailed {
                            node: node.name().to_string(),
                            message: err.to_string(),
                        })
                    }
                }
            }
            TaskPhase::Execute => {
                match node.state() {
                    NodeState::Compiled | NodeState::Ready | NodeState::Executing
                    | NodeState::Complete => {}
                    _ => return Ok(()),
                }
                node.set_state(NodeState::Executing);
                match node.behavior.lock().execute(&ctx) {
                    Ok(()) => {
                        node.set_state(NodeState::Complete);
                        Ok(())
                    }
                    Err(err) => {
                        // Failed execution queues a recompile, not a
                        // teardown.
                        node.set_state(NodeState::Dirty);
                        Err(GraphError::NodeError(
                            node.name().to_string(),
                            err.to_string(),
                        ))
                    }
                }
            }
            TaskPhase::Cleanup => {
                node.behavior.lock().cleanup(&ctx)?;
                node.set_state(NodeState::Created);
                Ok(())
            }
        }
    }

    /// After a compile phase, dependents of failed nodes become dirty so a
    /// later recompile retries them once their inputs change.
    fn propagate_compile_errors(&mut self) {
        let failed: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.state() == NodeState::Error)
            .map(|(id, _)| id)
            .collect();
        for id in failed {
            for descendant in self.topology.descendants(id) {
                let node = &self.nodes[descendant];
                if node.state() != NodeState::Error {
                    node.set_state(NodeState::Dirty);
                }
            }
        }
    }

    //---------------------------------------------------------------------
    // Frame loop

    /// Drain the bus and apply queued invalidations.
    pub fn process_events(&mut self) {
        self.bus.process_messages();

        let pending = {
            let mut queue = self.invalidations.lock();
            std::mem::take(&mut *queue)
        };

        if let Some((width, height)) = pending.resized {
            log::debug!("window resized to {width}x{height}, invalidating subtrees");
            let watchers = self.resize_watchers.clone();
            let image_producers: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, n)| {
                    n.schema()
                        .outputs
                        .iter()
                        .any(|d| d.tag == TypeTag::Image)
                })
                .map(|(id, _)| id)
                .collect();
            for id in watchers.into_iter().chain(image_producers) {
                self.invalidate_image_outputs(id);
                self.mark_subtree_dirty(id);
            }
        }

        for path in pending.shaders {
            if let Some(watchers) = self.shader_watchers.get(&path) {
                for id in watchers.clone() {
                    self.mark_subtree_dirty(id);
                }
            }
        }

        for request_id in pending.cleanup_requests {
            let count = self.cleanup.lock().run_all() as u32;
            log::info!("cleanup request {request_id}: ran {count} entries");
            self.bus
                .publish(CleanupCompletedMessage::new(self.sender_id, count));
        }

        if pending.close_requested && !self.shutdown_requested {
            self.shutdown_requested = true;
            self.bus
                .publish(CleanupRequestedMessage::new(self.sender_id, 0));
        }
        self.shutdown_acks.extend(pending.shutdown_acks);
    }

    /// Mark a node and its whole subtree dirty.
    pub fn mark_subtree_dirty(&mut self, root: NodeId) {
        let mut targets = vec![root];
        targets.extend(self.topology.descendants(root));
        for id in targets {
            if let Some(node) = self.nodes.get(id) {
                node.set_state(NodeState::Dirty);
            }
        }
    }

    fn invalidate_image_outputs(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(id) else { return };
        let image_outputs: Vec<ResourceId> = node
            .schema()
            .outputs
            .iter()
            .filter(|d| d.tag == TypeTag::Image)
            .flat_map(|d| node.output_bindings(d.index).to_vec())
            .collect();
        for resource in image_outputs {
            let _ = self.resources.with_write(resource, |r| r.invalidate());
        }
    }

    /// Re-run compile for dirty subtrees only, in execution order.
    pub fn recompile_dirty_nodes(&mut self) -> usize {
        if self.execution_order.is_empty() {
            return 0;
        }
        let dirty: Vec<NodeId> = self
            .execution_order
            .iter()
            .copied()
            .filter(|&id| self.nodes[id].state() == NodeState::Dirty)
            .collect();
        if dirty.is_empty() {
            return 0;
        }

        let mut recompiled = 0;
        for id in dirty {
            match self.run_task(VirtualTaskId::new(id, 0), TaskPhase::Compile) {
                Ok(()) => recompiled += 1,
                Err(err) => {
                    log::warn!("recompile of {} failed: {err}", self.node_name(id));
                }
            }
        }
        self.propagate_compile_errors();
        recompiled
    }

    /// Advance timers and loops.
    pub fn update_time(&mut self) {
        let frame_time = self.timer.tick();
        self.loops.set_current_frame(self.frame_index);
        self.loops.update_loops(frame_time);
    }

    /// Run one frame. Returns a report rather than failing the graph;
    /// failed tasks mark their nodes dirty for recompilation.
    pub fn render_frame(&mut self) -> GraphResult<FrameReport> {
        if !self.is_compiled {
            return Err(GraphError::NotCompiled("render_frame"));
        }

        self.process_events();
        let recompiled = self.recompile_dirty_nodes();
        self.update_time();

        // Frame start: completed nodes become ready, transients clear.
        self.resources.begin_frame();
        for (_, node) in self.nodes.iter() {
            if node.state() == NodeState::Complete {
                node.set_state(NodeState::Ready);
            }
        }

        self.executor.clear_errors();
        let success = self.run_phase(TaskPhase::Execute);
        let task_errors = self.executor.errors();

        // End of frame: fold samples, then let the capacity trackers walk
        // the pressure valves.
        self.profiles.process_all_samples();
        for tracker in &mut self.capacity_trackers {
            tracker.update(&mut self.profiles);
        }

        let report = FrameReport {
            frame_index: self.frame_index,
            success,
            task_errors,
            recompiled_nodes: recompiled,
        };
        self.frame_index += 1;
        Ok(report)
    }

    //---------------------------------------------------------------------
    // Shutdown

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn shutdown_acks(&self) -> &[String] {
        &self.shutdown_acks
    }

    /// Tear everything down: the node cleanup phase through the executor,
    /// then the dependency-ordered cleanup stack, then the arenas.
    pub fn clear(&mut self) {
        if self.executor.is_built() {
            self.run_phase(TaskPhase::Cleanup);
        }
        let cleaned = self.cleanup.lock().run_all();
        if cleaned > 0 {
            self.bus
                .publish(CleanupCompletedMessage::new(self.sender_id, cleaned as u32));
        }

        self.nodes.clear();
        self.by_name.clear();
        self.by_type.clear();
        self.resources.clear();
        self.topology.clear();
        self.execution_order.clear();
        self.executor.clear();
        self.shader_watchers.clear();
        self.resize_watchers.clear();
        // Extraction happens before teardown; afterwards the logger tree is
        // cleared so destroyed nodes do not linger.
        self.logger.clear_children();
        self.is_compiled = false;
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        self.clear();
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
    }
}
