//! The typed node contract.
//!
//! A node goes through four lifecycle phases:
//! * `setup`: graph-scope init, must not read inputs
//! * `compile`: allocate per-node resources, read Dependency-role inputs
//! * `execute`: per frame, read Execute-role inputs, write outputs
//! * `cleanup`: release per-node resources
//!
//! The phase context enforces the contract at the access site: reading an
//! Execute-role input during Compile is rejected, and writes are only
//! accepted on slots whose mutability allows them.

use std::sync::Arc;

use downcast_rs::{impl_downcast, Downcast};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{GraphError, GraphResult};
use crate::events::MessageBus;
use crate::graph::{CleanupHandle, CleanupStack, LoopManager, NodeId};
use crate::interop::DeviceCache;
use crate::logger::Logger;
use crate::registry::NodeTypeId;
use crate::resource::{ResourceArena, ResourceData, ResourceId};
use crate::slots::{NodeSchema, SlotRole};
use crate::tasks::TaskPhase;

/// Per-node state machine. `Dirty` is re-entrable: a dirty node re-runs
/// `compile` before its next `execute`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum NodeState {
    #[default]
    Created,
    Setup,
    Compiled,
    Ready,
    Executing,
    Complete,
    Dirty,
    Error,
}

//--------------------------------------------------------------------------------------------------
// Parameters

/// Name-keyed typed scalar set on a node before `compile`. Changing a
/// parameter after compilation marks the node dirty.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Text(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::U32(_) => "u32",
            ParamValue::I64(_) => "i64",
            ParamValue::U64(_) => "u64",
            ParamValue::F32(_) => "f32",
            ParamValue::F64(_) => "f64",
            ParamValue::Text(_) => "text",
        }
    }
}

macro_rules! impl_param_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for ParamValue {
            fn from(v: $ty) -> ParamValue {
                ParamValue::$variant(v)
            }
        }
    };
}

impl_param_from!(bool, Bool);
impl_param_from!(u32, U32);
impl_param_from!(i64, I64);
impl_param_from!(u64, U64);
impl_param_from!(f32, F32);
impl_param_from!(f64, F64);
impl_param_from!(String, Text);

impl From<&str> for ParamValue {
    fn from(v: &str) -> ParamValue {
        ParamValue::Text(v.to_string())
    }
}

/// Typed extraction from a parameter value.
pub trait FromParam: Sized {
    const TYPE_NAME: &'static str;
    fn from_param(value: &ParamValue) -> Option<Self>;
}

macro_rules! impl_from_param {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromParam for $ty {
            const TYPE_NAME: &'static str = $name;
            fn from_param(value: &ParamValue) -> Option<Self> {
                match value {
                    ParamValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_from_param!(bool, Bool, "bool");
impl_from_param!(u32, U32, "u32");
impl_from_param!(i64, I64, "i64");
impl_from_param!(u64, U64, "u64");
impl_from_param!(f32, F32, "f32");
impl_from_param!(f64, F64, "f64");
impl_from_param!(String, Text, "text");

//--------------------------------------------------------------------------------------------------
// Bundles

/// A logical sub-unit of a node, exposed for intra-node parallelism.
/// `read_slots` index into the node's inputs, `write_slots` into its
/// outputs. A node with one bundle covering every slot is an ordinary node.
#[derive(Clone, Debug, Default)]
pub struct BundleSpec {
    pub read_slots: SmallVec<[u32; 4]>,
    pub write_slots: SmallVec<[u32; 4]>,
}

impl BundleSpec {
    pub fn new(
        read_slots: impl IntoIterator<Item = u32>,
        write_slots: impl IntoIterator<Item = u32>,
    ) -> BundleSpec {
        BundleSpec {
            read_slots: read_slots.into_iter().collect(),
            write_slots: write_slots.into_iter().collect(),
        }
    }

    /// The default single bundle covering the full slot set.
    pub fn full(schema: &NodeSchema) -> BundleSpec {
        BundleSpec {
            read_slots: (0..schema.input_count() as u32).collect(),
            write_slots: (0..schema.output_count() as u32).collect(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Node trait

pub use crate::profile::SharedProfile;

/// The node lifecycle. Implementations keep their per-node state in `self`;
/// everything shared flows through the context.
pub trait Node: Downcast + Send {
    fn setup(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }

    fn compile(&mut self, ctx: &NodeCtx) -> GraphResult<()>;

    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()>;

    fn cleanup(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }

    /// Bundles for intra-node parallelism. Defaults to one bundle covering
    /// the full slot set.
    fn bundles(&self, schema: &NodeSchema) -> Vec<BundleSpec> {
        vec![BundleSpec::full(schema)]
    }

    /// Nodes may opt out of parallel scheduling; their tasks are serialized
    /// into dedicated levels of size one.
    fn parallelizable(&self) -> bool {
        true
    }
}

impl_downcast!(Node);

//--------------------------------------------------------------------------------------------------
// Node instance

type SlotBindings = SmallVec<[ResourceId; 1]>;

/// A node added to the graph: identity, parameters, slot bindings and the
/// behavior trait object. Owned by the graph's node arena.
pub struct NodeInstance {
    name: String,
    type_id: NodeTypeId,
    type_name: String,
    schema: Arc<NodeSchema>,
    params: FxHashMap<String, ParamValue>,
    /// `[slot][array_index]`, empty when unconnected.
    inputs: Vec<SlotBindings>,
    outputs: Vec<SlotBindings>,
    dependencies: Vec<NodeId>,
    execution_index: u32,
    state: Mutex<NodeState>,
    pub(crate) behavior: Mutex<Box<dyn Node>>,
    logger: Arc<Logger>,
    bundles: Vec<BundleSpec>,
    profiles: FxHashMap<u32, Vec<SharedProfile>>,
    parallelizable: bool,
}

impl NodeInstance {
    pub fn new(
        name: impl Into<String>,
        type_id: NodeTypeId,
        type_name: impl Into<String>,
        schema: Arc<NodeSchema>,
        behavior: Box<dyn Node>,
    ) -> NodeInstance {
        let name = name.into();
        let bundles = behavior.bundles(schema.as_ref());
        let parallelizable = behavior.parallelizable();
        let inputs = vec![SlotBindings::new(); schema.input_count()];
        let outputs = vec![SlotBindings::new(); schema.output_count()];
        NodeInstance {
            logger: Arc::new(Logger::new(name.as_str())),
            name,
            type_id,
            type_name: type_name.into(),
            schema,
            params: FxHashMap::default(),
            inputs,
            outputs,
            dependencies: Vec::new(),
            execution_index: 0,
            state: Mutex::new(NodeState::Created),
            behavior: Mutex::new(behavior),
            bundles,
            profiles: FxHashMap::default(),
            parallelizable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> NodeTypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn schema(&self) -> &NodeSchema {
        &self.schema
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    //---------------------------------------------------------------------
    // State

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    //---------------------------------------------------------------------
    // Parameters

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn param_raw(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn param<T: FromParam>(&self, name: &str) -> GraphResult<T> {
        let value = self
            .params
            .get(name)
            .ok_or_else(|| GraphError::UnknownParameter(name.to_string()))?;
        T::from_param(value).ok_or_else(|| GraphError::ParameterTypeMismatch {
            name: name.to_string(),
            expected: T::TYPE_NAME,
            actual: value.type_name(),
        })
    }

    //---------------------------------------------------------------------
    // Slot bindings (graph-internal)

    pub(crate) fn bind_input(&mut self, slot: u32, resource: ResourceId) {
        self.inputs[slot as usize].push(resource);
    }

    pub(crate) fn bind_output(&mut self, slot: u32, resource: ResourceId) {
        self.outputs[slot as usize].push(resource);
    }

    pub fn input_bindings(&self, slot: u32) -> &[ResourceId] {
        self.inputs
            .get(slot as usize)
            .map_or(&[], |bindings| bindings.as_slice())
    }

    pub fn output_bindings(&self, slot: u32) -> &[ResourceId] {
        self.outputs
            .get(slot as usize)
            .map_or(&[], |bindings| bindings.as_slice())
    }

    //---------------------------------------------------------------------
    // Dependencies and ordering

    pub(crate) fn add_dependency(&mut self, node: NodeId) {
        if !self.dependencies.contains(&node) {
            self.dependencies.push(node);
        }
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    pub fn execution_index(&self) -> u32 {
        self.execution_index
    }

    pub(crate) fn set_execution_index(&mut self, index: u32) {
        self.execution_index = index;
    }

    //---------------------------------------------------------------------
    // Bundles and profiles

    pub fn bundles(&self) -> &[BundleSpec] {
        &self.bundles
    }

    pub fn bundle_count(&self) -> u32 {
        self.bundles.len() as u32
    }

    pub fn is_parallelizable(&self) -> bool {
        self.parallelizable
    }

    /// Attach a task profile to one bundle; the executor samples it around
    /// each execution of that bundle.
    pub fn attach_profile(&mut self, bundle: u32, profile: SharedProfile) {
        self.profiles.entry(bundle).or_default().push(profile);
    }

    pub fn bundle_profiles(&self, bundle: u32) -> &[SharedProfile] {
        self.profiles
            .get(&bundle)
            .map_or(&[], |profiles| profiles.as_slice())
    }
}

//--------------------------------------------------------------------------------------------------
// Phase context

/// Phase-specific accessor handed to node lifecycle methods. One type for
/// all phases; the phase field drives the role checks.
pub struct NodeCtx<'a> {
    pub(crate) phase: TaskPhase,
    pub(crate) bundle: u32,
    pub(crate) node_id: NodeId,
    pub(crate) node: &'a NodeInstance,
    pub(crate) resources: &'a ResourceArena,
    pub(crate) bus: &'a MessageBus,
    pub(crate) loops: &'a LoopManager,
    pub(crate) device: Option<&'a Arc<dyn DeviceCache>>,
    pub(crate) cleanup: &'a Mutex<CleanupStack>,
    pub(crate) frame_index: u64,
}

impl<'a> NodeCtx<'a> {
    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn bundle(&self) -> u32 {
        self.bundle
    }

    pub fn node_name(&self) -> &str {
        self.node.name()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn message_bus(&self) -> &MessageBus {
        self.bus
    }

    pub fn loops(&self) -> &LoopManager {
        self.loops
    }

    pub fn device(&self) -> Option<&Arc<dyn DeviceCache>> {
        self.device
    }

    pub fn logger(&self) -> &Logger {
        self.node.logger()
    }

    /// Register a teardown closure for externally-managed resources,
    /// ordered before the entries it depends on.
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
    // Typed input access

    fn readable_input(&self, slot: u32) -> GraphResult<()> {
        let desc = self
            .node
            .schema()
            .input(slot)
            .ok_or(GraphError::InvalidSlotIndex {
                node: self.node.name().to_string(),
                kind: "input",
                index: slot,
            })?;
        if !desc.reads() {
            return Err(GraphError::SlotNotWritable {
                slot: desc.name.to_string(),
            });
        }
        let readable = match self.phase {
            TaskPhase::Setup => false,
            TaskPhase::Compile => desc.role == SlotRole::Dependency,
            TaskPhase::Execute => desc.role == SlotRole::Execute,
            // Cleanup may read the dependency handles it has to release.
            TaskPhase::Cleanup => desc.role == SlotRole::Dependency,
        };
        if !readable {
            return Err(GraphError::SlotNotReadableInPhase {
                slot: desc.name.to_string(),
                phase: self.phase,
            });
        }
        Ok(())
    }

    /// Read input `slot` at array index 0.
    pub fn input<T: ResourceData>(&self, slot: u32) -> GraphResult<T> {
        self.input_at(slot, 0)
    }

    /// Read input `slot` at a specific array index (fixed/variadic/
    /// accumulation slots).
    pub fn input_at<T: ResourceData>(&self, slot: u32, index: usize) -> GraphResult<T> {
        self.readable_input(slot)?;
        let bindings = self.node.input_bindings(slot);
        let id = *bindings
            .get(index)
            .ok_or_else(|| GraphError::InputNotConnected {
                slot: self.node.schema().input(slot).map_or("?", |d| d.name).to_string(),
                index,
            })?;
        self.resources.with_read(id, |resource| resource.get::<T>())?
    }

    /// Typed read of a `Dyn` input payload.
    pub fn input_dyn<T: std::any::Any + Send + Sync>(&self, slot: u32) -> GraphResult<Arc<T>> {
        self.readable_input(slot)?;
        let bindings = self.node.input_bindings(slot);
        let id = *bindings
            .first()
            .ok_or_else(|| GraphError::InputNotConnected {
                slot: self.node.schema().input(slot).map_or("?", |d| d.name).to_string(),
                index: 0,
            })?;
        self.resources
            .with_read(id, |resource| resource.get_dyn::<T>())?
    }

    /// Mutate a `ReadWrite` input in place. Rejected for read-only slots;
    /// the same phase/role rules as reads apply.
    pub fn write_input<T: ResourceData>(&self, slot: u32, value: T) -> GraphResult<()> {
        let desc = self
            .node
            .schema()
            .input(slot)
            .ok_or(GraphError::InvalidSlotIndex {
                node: self.node.name().to_string(),
                kind: "input",
                index: slot,
            })?;
        if !desc.writes() {
            return Err(GraphError::SlotNotWritable {
                slot: desc.name.to_string(),
            });
        }
        self.readable_input(slot)?;
        let id = *self
            .node
            .input_bindings(slot)
            .first()
            .ok_or_else(|| GraphError::InputNotConnected {
                slot: desc.name.to_string(),
                index: 0,
            })?;
        self.resources
            .with_write(id, |resource| resource.set(value))?
    }

    /// Number of connections bound to an input slot.
    pub fn input_count(&self, slot: u32) -> usize {
        self.node.input_bindings(slot).len()
    }

    pub fn is_input_connected(&self, slot: u32) -> bool {
        self.input_count(slot) > 0
    }

    //---------------------------------------------------------------------
    // Typed output access

    fn writable_output(&self, slot: u32) -> GraphResult<ResourceId> {
        let desc = self
            .node
            .schema()
            .output(slot)
            .ok_or(GraphError::InvalidSlotIndex {
                node: self.node.name().to_string(),
                kind: "output",
                index: slot,
            })?;
        if !desc.writes() {
            return Err(GraphError::SlotNotWritable {
                slot: desc.name.to_string(),
            });
        }
        if !matches!(self.phase, TaskPhase::Compile | TaskPhase::Execute) {
            return Err(GraphError::SlotNotReadableInPhase {
                slot: desc.name.to_string(),
                phase: self.phase,
            });
        }
        self.node
            .output_bindings(slot)
            .first()
            .copied()
            .ok_or(GraphError::UnknownResource)
    }

    /// Write output `slot`. The resource tag carries the type check.
    pub fn output<T: ResourceData>(&self, slot: u32, value: T) -> GraphResult<()> {
        let id = self.writable_output(slot)?;
        self.resources
            .with_write(id, |resource| resource.set(value))?
    }

    /// Write an output from an untyped resource value (constant injection,
    /// image/buffer payloads). The declared tag still applies.
    pub fn output_raw(
        &self,
        slot: u32,
        value: crate::resource::ResourceValue,
    ) -> GraphResult<()> {
        let id = self.writable_output(slot)?;
        self.resources
            .with_write(id, |resource| resource.set_value(value))?
    }

    /// Read back an output written earlier in the same phase.
    pub fn read_output<T: ResourceData>(&self, slot: u32) -> GraphResult<T> {
        if self.node.schema().output(slot).is_none() {
            return Err(GraphError::InvalidSlotIndex {
                node: self.node.name().to_string(),
                kind: "output",
                index: slot,
            });
        }
        let id = self
            .node
            .output_bindings(slot)
            .first()
            .copied()
            .ok_or(GraphError::UnknownResource)?;
        self.resources.with_read(id, |resource| resource.get::<T>())?
    }

    //---------------------------------------------------------------------
    // Parameters

    pub fn param<T: FromParam>(&self, name: &str) -> GraphResult<T> {
        self.node.param(name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.node.param_raw(name).is_some()
    }
}

//--------------------------------------------------------------------------------------------------
