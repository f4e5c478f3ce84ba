//! Built-in node types.
//!
//! Only the types the core itself depends on live here: constant injection
//! and the loop bridge. Scene-level nodes (cameras, pipelines, present)
//! belong to the application.

mod constant;
mod loop_bridge;

pub use self::constant::{constant_node_type, ConstantNode};
pub use self::loop_bridge::LoopBridgeNode;

use crate::registry::NodeTypeRegistry;
use crate::resource::TypeTag;

/// Register the built-in node types: one constant type per scalar-ish tag
/// plus the loop bridge.
pub fn register_builtin_node_types(registry: &mut NodeTypeRegistry) {
    registry.register_node_type(constant_node_type("Constant.U32", TypeTag::U32));
    registry.register_node_type(constant_node_type("Constant.U64", TypeTag::U64));
    registry.register_node_type(constant_node_type("Constant.I64", TypeTag::I64));
    registry.register_node_type(constant_node_type("Constant.F32", TypeTag::F32));
    registry.register_node_type(constant_node_type("Constant.F64", TypeTag::F64));
    registry.register_node_type(constant_node_type("Constant.Bool", TypeTag::Bool));
    registry.register_node_type(constant_node_type("Constant.Text", TypeTag::Text));
    registry.register_node_type(constant_node_type("Constant.Handle", TypeTag::Handle));
    registry.register_node_type(constant_node_type("Constant.Dyn", TypeTag::Dyn));
    registry.register::<LoopBridgeNode>();
}
