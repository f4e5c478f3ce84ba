//! Slot descriptors and node schemas.
//!
//! A node type declares its inputs and outputs as a flat table of
//! `SlotDesc` values. The table replaces per-type inheritance: the runtime
//! checks every access against the descriptor (role, mutability, arity) and
//! the resource tag carries the type check.

use crate::resource::{ResourceDescriptor, ResourceLifetime, TypeTag};

/// Whether a slot must be connected for the graph to validate.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SlotNullability {
    #[default]
    Required,
    Optional,
}

/// Which phase may read an input slot. `Dependency` inputs are consumed
/// during Compile, `Execute` inputs during Execute.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SlotRole {
    #[default]
    Dependency,
    Execute,
}

/// Conflict rules: two tasks conflict on a resource iff at least one of the
/// accesses is a write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SlotMutability {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Whether the slot's value is node-local or shared across the graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SlotScope {
    #[default]
    NodeLevel,
    GraphLevel,
}

/// Connection arity of a slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SlotArrayMode {
    /// Exactly one connection.
    #[default]
    Single,
    /// A fixed number of connections, bound by array index.
    Fixed(u32),
    /// Any number of connections, bound by array index in connection order.
    Variadic,
    /// Collects many writers into a bag (descriptor-resource gathering).
    Accumulation,
}

//--------------------------------------------------------------------------------------------------

/// Compile-time declared slot metadata plus the runtime description used for
/// schema validation before the payload exists.
#[derive(Clone, Debug)]
pub struct SlotDesc {
    pub index: u32,
    pub name: &'static str,
    pub tag: TypeTag,
    pub nullability: SlotNullability,
    pub role: SlotRole,
    pub mutability: SlotMutability,
    pub scope: SlotScope,
    pub array_mode: SlotArrayMode,
    pub lifetime: ResourceLifetime,
    pub description: ResourceDescriptor,
}

impl SlotDesc {
    /// A required, read-only, compile-phase input. The common case.
    pub fn input(index: u32, name: &'static str, tag: TypeTag) -> SlotDesc {
        SlotDesc {
            index,
            name,
            tag,
            nullability: SlotNullability::Required,
            role: SlotRole::Dependency,
            mutability: SlotMutability::ReadOnly,
            scope: SlotScope::NodeLevel,
            array_mode: SlotArrayMode::Single,
            lifetime: ResourceLifetime::Persistent,
            description: ResourceDescriptor::None,
        }
    }

    /// A required, write-only output.
    pub fn output(index: u32, name: &'static str, tag: TypeTag) -> SlotDesc {
        SlotDesc {
            index,
            name,
            tag,
            nullability: SlotNullability::Required,
            role: SlotRole::Execute,
            mutability: SlotMutability::WriteOnly,
            scope: SlotScope::NodeLevel,
            array_mode: SlotArrayMode::Single,
            lifetime: ResourceLifetime::Persistent,
            description: ResourceDescriptor::None,
        }
    }

    pub fn optional(mut self) -> SlotDesc {
        self.nullability = SlotNullability::Optional;
        self
    }

    pub fn execute_role(mut self) -> SlotDesc {
        self.role = SlotRole::Execute;
        self
    }

    pub fn dependency_role(mut self) -> SlotDesc {
        self.role = SlotRole::Dependency;
        self
    }

    pub fn mutability(mut self, mutability: SlotMutability) -> SlotDesc {
        self.mutability = mutability;
        self
    }

    pub fn graph_level(mut self) -> SlotDesc {
        self.scope = SlotScope::GraphLevel;
        self
    }

    pub fn array_mode(mut self, mode: SlotArrayMode) -> SlotDesc {
        self.array_mode = mode;
        self
    }

    pub fn transient(mut self) -> SlotDesc {
        self.lifetime = ResourceLifetime::Transient;
        self
    }

    pub fn description(mut self, description: ResourceDescriptor) -> SlotDesc {
        self.description = description;
        self
    }

    pub fn is_required(&self) -> bool {
        self.nullability == SlotNullability::Required
    }

    pub fn writes(&self) -> bool {
        matches!(
            self.mutability,
            SlotMutability::WriteOnly | SlotMutability::ReadWrite
        )
    }

    pub fn reads(&self) -> bool {
        matches!(
            self.mutability,
            SlotMutability::ReadOnly | SlotMutability::ReadWrite
        )
    }
}

//--------------------------------------------------------------------------------------------------

/// The full static I/O contract of a node type.
#[derive(Clone, Debug, Default)]
pub struct NodeSchema {
    pub inputs: Vec<SlotDesc>,
    pub outputs: Vec<SlotDesc>,
}

impl NodeSchema {
    pub fn new(inputs: Vec<SlotDesc>, outputs: Vec<SlotDesc>) -> NodeSchema {
        debug_assert!(inputs.iter().enumerate().all(|(i, s)| s.index as usize == i));
        debug_assert!(outputs.iter().enumerate().all(|(i, s)| s.index as usize == i));
        NodeSchema { inputs, outputs }
    }

    pub fn input(&self, index: u32) -> Option<&SlotDesc> {
        self.inputs.get(index as usize)
    }

    pub fn output(&self, index: u32) -> Option<&SlotDesc> {
        self.outputs.get(index as usize)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }
}

//--------------------------------------------------------------------------------------------------
