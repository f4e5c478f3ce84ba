//! Loop bridge node: exposes a registered loop's per-frame state as graph
//! outputs so downstream nodes can gate their work on it.

use crate::error::{GraphError, GraphResult};
use crate::node::{Node, NodeCtx};
use crate::registry::RegisterableNode;
use crate::resource::TypeTag;
use crate::slots::{NodeSchema, SlotDesc};

pub struct LoopBridgeNode {
    loop_id: u32,
}

impl LoopBridgeNode {
    pub const OUT_SHOULD_EXECUTE: u32 = 0;
    pub const OUT_DELTA_TIME: u32 = 1;
    pub const OUT_STEP_COUNT: u32 = 2;

    pub const PARAM_LOOP_ID: &'static str = "loopId";
}

impl Node for LoopBridgeNode {
    fn compile(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let loop_id = ctx.param::<u32>(Self::PARAM_LOOP_ID)?;
        // Fail compilation early on a dangling loop id.
        ctx.loops().loop_reference(loop_id).map_err(|_| {
            GraphError::NodeError(
                ctx.node_name().to_string(),
                format!("loop {loop_id} is not registered"),
            )
        })?;
        self.loop_id = loop_id;
        Ok(())
    }

    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let reference = ctx.loops().loop_reference(self.loop_id)?;
        ctx.output(Self::OUT_SHOULD_EXECUTE, reference.should_execute_this_frame)?;
        ctx.output(Self::OUT_DELTA_TIME, reference.delta_time)?;
        ctx.output(Self::OUT_STEP_COUNT, reference.step_count)?;
        Ok(())
    }
}

impl RegisterableNode for LoopBridgeNode {
    fn type_name() -> &'static str {
        "LoopBridge"
    }

    fn schema() -> NodeSchema {
        NodeSchema::new(
            vec![],
            vec![
                SlotDesc::output(
                    LoopBridgeNode::OUT_SHOULD_EXECUTE,
                    "should_execute",
                    TypeTag::Bool,
                )
                .transient(),
                SlotDesc::output(LoopBridgeNode::OUT_DELTA_TIME, "delta_time", TypeTag::F64)
                    .transient(),
                SlotDesc::output(LoopBridgeNode::OUT_STEP_COUNT, "step_count", TypeTag::U64)
                    .transient(),
            ],
        )
    }

    fn create(_instance_name: &str) -> LoopBridgeNode {
        LoopBridgeNode { loop_id: 0 }
    }
}
