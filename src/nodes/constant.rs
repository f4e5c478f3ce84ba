//! Constant node: injects an externally produced value into the graph.
//!
//! Lets non-node resources (a manually created shader bundle, a texture, a
//! plain scalar) participate in the topology as an ordinary output. An
//! optional cleanup callback covers externally-managed resources; it is
//! registered into the cleanup stack with explicit dependency handles.

use crate::error::{GraphError, GraphResult};
use crate::graph::CleanupHandle;
use crate::node::{Node, NodeCtx};
use crate::registry::NodeType;
use crate::resource::{HandleDescriptor, ResourceData, ResourceDescriptor, ResourceValue, TypeTag};
use crate::slots::{NodeSchema, SlotDesc};

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Build a constant node type for one resource tag. Constants are typed;
/// register one type per tag you need (`Constant.U32`, `Constant.Dyn`, ...).
pub fn constant_node_type(type_name: &str, tag: TypeTag) -> NodeType {
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "value", tag)
            .description(ResourceDescriptor::Handle(HandleDescriptor {
                type_name: String::from("Constant"),
            }))],
    );
    NodeType::new(type_name, schema, |_| Box::new(ConstantNode::default()))
}

#[derive(Default)]
pub struct ConstantNode {
    value: Option<ResourceValue>,
    cleanup_callback: Option<CleanupFn>,
    cleanup_depends_on: Vec<CleanupHandle>,
}

impl ConstantNode {
    /// Set the constant value. Must happen before `compile`; the tag must
    /// match the node type's output tag.
    pub fn set_value<T: ResourceData>(&mut self, value: T) {
        self.value = Some(value.into_value());
    }

    pub fn set_value_raw(&mut self, value: ResourceValue) {
        self.value = Some(value);
    }

    /// Cleanup for externally-managed resources. `depends_on` lists the
    /// nodes that must be cleaned up after this one (e.g. the device the
    /// resource was created from).
    pub fn set_cleanup(
        &mut self,
        callback: impl FnOnce() + Send + 'static,
        depends_on: Vec<CleanupHandle>,
    ) {
        self.cleanup_callback = Some(Box::new(callback));
        self.cleanup_depends_on = depends_on;
    }
}

impl Node for ConstantNode {
    fn compile(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let value = self.value.clone().ok_or_else(|| {
            GraphError::NodeError(
                ctx.node_name().to_string(),
                String::from("constant value not set before compile"),
            )
        })?;
        ctx.output_raw(0, value)?;

        if let Some(callback) = self.cleanup_callback.take() {
            ctx.register_cleanup(
                CleanupHandle::from_node(ctx.node_id()),
                format!("{}_cleanup", ctx.node_name()),
                callback,
                self.cleanup_depends_on.clone(),
            );
        }
        Ok(())
    }

    fn execute(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        // Data node; the value was produced at compile time.
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        self.value = None;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
