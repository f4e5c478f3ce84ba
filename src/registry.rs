//! Node type registry.
//!
//! Maps type names and ids to factories. Registration order determines id
//! assignment within a process but is irrelevant to persistence.

use std::sync::Arc;

use bitflags::bitflags;
use fxhash::FxHashMap;

use crate::node::{Node, NodeInstance};
use crate::slots::NodeSchema;

pub type NodeTypeId = u32;

/// Coarse classification used by enumeration filters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum PipelineKind {
    Graphics,
    Compute,
    Transfer,
    #[default]
    Utility,
}

bitflags! {
    /// Device features a node type needs before it can be instantiated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCapability: u32 {
        const GRAPHICS           = 1 << 0;
        const COMPUTE            = 1 << 1;
        const PRESENT            = 1 << 2;
        const TIMESTAMP_QUERIES  = 1 << 3;
        const SPARSE_BINDING     = 1 << 4;
    }
}

type NodeFactory = Box<dyn Fn(&str) -> Box<dyn Node> + Send + Sync>;

/// A registered node type: static slot schema plus the factory that builds
/// instances and populates them from it.
pub struct NodeType {
    type_id: NodeTypeId,
    type_name: String,
    schema: Arc<NodeSchema>,
    max_instances: u32,
    pipeline_kind: PipelineKind,
    required_capabilities: DeviceCapability,
    factory: NodeFactory,
}

impl NodeType {
    pub fn new(
        type_name: impl Into<String>,
        schema: NodeSchema,
        factory: impl Fn(&str) -> Box<dyn Node> + Send + Sync + 'static,
    ) -> NodeType {
        NodeType {
            type_id: 0,
            type_name: type_name.into(),
            schema: Arc::new(schema),
            max_instances: 0,
            pipeline_kind: PipelineKind::Utility,
            required_capabilities: DeviceCapability::empty(),
            factory: Box::new(factory),
        }
    }

    /// Limit how many instances of this type a graph may hold. Zero means
    /// unlimited.
    pub fn with_max_instances(mut self, max: u32) -> NodeType {
        self.max_instances = max;
        self
    }

    pub fn with_pipeline_kind(mut self, kind: PipelineKind) -> NodeType {
        self.pipeline_kind = kind;
        self
    }

    pub fn with_capabilities(mut self, capabilities: DeviceCapability) -> NodeType {
        self.required_capabilities = capabilities;
        self
    }

    pub fn type_id(&self) -> NodeTypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn schema(&self) -> &Arc<NodeSchema> {
        &self.schema
    }

    pub fn max_instances(&self) -> u32 {
        self.max_instances
    }

    pub fn pipeline_kind(&self) -> PipelineKind {
        self.pipeline_kind
    }

    pub fn required_capabilities(&self) -> DeviceCapability {
        self.required_capabilities
    }

    /// Build a node instance and populate its slot schema from the type's
    /// static config.
    pub fn create_instance(&self, instance_name: &str) -> NodeInstance {
        let behavior = (self.factory)(instance_name);
        NodeInstance::new(
            instance_name,
            self.type_id,
            self.type_name.clone(),
            Arc::clone(&self.schema),
            behavior,
        )
    }
}

/// Static description of a registerable node type, for `register::<T>()`.
pub trait RegisterableNode: Node + Sized {
    fn type_name() -> &'static str;
    fn schema() -> NodeSchema;
    fn create(instance_name: &str) -> Self;

    fn node_type() -> NodeType {
        NodeType::new(Self::type_name(), Self::schema(), |name| {
            Box::new(Self::create(name))
        })
    }
}

//--------------------------------------------------------------------------------------------------

/// Name/id to factory registry with collision checks on both keys.
#[derive(Default)]
pub struct NodeTypeRegistry {
    types_by_id: FxHashMap<NodeTypeId, NodeType>,
    name_to_id: FxHashMap<String, NodeTypeId>,
    next_type_id: NodeTypeId,
}

impl NodeTypeRegistry {
    pub fn new() -> NodeTypeRegistry {
        NodeTypeRegistry {
            types_by_id: FxHashMap::default(),
            name_to_id: FxHashMap::default(),
            next_type_id: 1,
        }
    }

    /// Register a statically described node type.
    pub fn register<T: RegisterableNode>(&mut self) -> bool {
        self.register_node_type(T::node_type())
    }

    /// Register a node type built at runtime. Returns false on a name or id
    /// collision.
    pub fn register_node_type(&mut self, mut node_type: NodeType) -> bool {
        if self.name_to_id.contains_key(node_type.type_name()) {
            return false;
        }
        let type_id = self.next_type_id;
        self.next_type_id += 1;
        node_type.type_id = type_id;
        self.name_to_id
            .insert(node_type.type_name.clone(), type_id);
        self.types_by_id.insert(type_id, node_type);
        true
    }

    pub fn unregister_by_id(&mut self, type_id: NodeTypeId) -> bool {
        match self.types_by_id.remove(&type_id) {
            Some(node_type) => {
                self.name_to_id.remove(node_type.type_name());
                true
            }
            None => false,
        }
    }

    pub fn unregister_by_name(&mut self, type_name: &str) -> bool {
        match self.name_to_id.get(type_name).copied() {
            Some(type_id) => self.unregister_by_id(type_id),
            None => false,
        }
    }

    pub fn get(&self, type_id: NodeTypeId) -> Option<&NodeType> {
        self.types_by_id.get(&type_id)
    }

    pub fn get_by_name(&self, type_name: &str) -> Option<&NodeType> {
        self.name_to_id
            .get(type_name)
            .and_then(|id| self.types_by_id.get(id))
    }

    pub fn has(&self, type_id: NodeTypeId) -> bool {
        self.types_by_id.contains_key(&type_id)
    }

    pub fn has_name(&self, type_name: &str) -> bool {
        self.name_to_id.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.types_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types_by_id.is_empty()
    }

    pub fn all_types(&self) -> Vec<&NodeType> {
        let mut types: Vec<&NodeType> = self.types_by_id.values().collect();
        types.sort_by_key(|t| t.type_id);
        types
    }

    pub fn types_by_pipeline(&self, kind: PipelineKind) -> Vec<&NodeType> {
        let mut types: Vec<&NodeType> = self
            .types_by_id
            .values()
            .filter(|t| t.pipeline_kind == kind)
            .collect();
        types.sort_by_key(|t| t.type_id);
        types
    }

    pub fn types_with_capability(&self, capability: DeviceCapability) -> Vec<&NodeType> {
        let mut types: Vec<&NodeType> = self
            .types_by_id
            .values()
            .filter(|t| t.required_capabilities.contains(capability))
            .collect();
        types.sort_by_key(|t| t.type_id);
        types
    }

    pub fn clear(&mut self) {
        self.types_by_id.clear();
        self.name_to_id.clear();
        self.next_type_id = 1;
    }
}

//--------------------------------------------------------------------------------------------------
