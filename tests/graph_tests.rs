//! End-to-end graph scenarios: construction, compilation, execution order,
//! parallel levels, conflict ordering, batch atomicity, dirty recompilation.

use std::sync::Arc;

use parking_lot::Mutex;

use rendergraph::node::{Node, NodeCtx};
use rendergraph::registry::NodeType;
use rendergraph::{
    ConnectionBatch, GraphError, GraphResult, Logger, MessageBus, NodeId, NodeSchema,
    NodeState, NodeTypeRegistry, RenderGraph, SlotDesc, SlotMutability, TypeTag,
    VirtualTaskId,
};

//--------------------------------------------------------------------------------------------------
// Test node types

/// Produces a fixed u32 every frame.
struct SourceNode {
    value: u32,
}

impl Node for SourceNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        ctx.output(0, self.value)
    }
}

fn source_type() -> NodeType {
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    NodeType::new("Source", schema, |_| Box::new(SourceNode { value: 42 }))
}

/// Doubles its input.
struct DoubleNode;

impl Node for DoubleNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let input: u32 = ctx.input(0)?;
        ctx.output(0, input * 2)
    }
}

fn double_type() -> NodeType {
    let schema = NodeSchema::new(
        vec![SlotDesc::input(0, "in", TypeTag::U32).execute_role()],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    NodeType::new("Double", schema, |_| Box::new(DoubleNode))
}

/// Records every value it consumes.
struct SinkNode {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl Node for SinkNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let input: u32 = ctx.input(0)?;
        self.seen.lock().push(input);
        Ok(())
    }
}

fn sink_type(seen: Arc<Mutex<Vec<u32>>>) -> NodeType {
    let schema = NodeSchema::new(
        vec![SlotDesc::input(0, "in", TypeTag::U32).execute_role()],
        vec![],
    );
    NodeType::new("Sink", schema, move |_| {
        Box::new(SinkNode {
            seen: Arc::clone(&seen),
        })
    })
}

/// Two outputs, for the diamond scenario.
struct SplitNode;

impl Node for SplitNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        ctx.output(0, 1u32)?;
        ctx.output(1, 2u32)
    }
}

fn split_type() -> NodeType {
    let schema = NodeSchema::new(
        vec![],
        vec![
            SlotDesc::output(0, "left", TypeTag::U32).transient(),
            SlotDesc::output(1, "right", TypeTag::U32).transient(),
        ],
    );
    NodeType::new("Split", schema, |_| Box::new(SplitNode))
}

/// Joins two inputs.
struct JoinNode {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl Node for JoinNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let a: u32 = ctx.input(0)?;
        let b: u32 = ctx.input(1)?;
        self.seen.lock().push(a + b);
        Ok(())
    }
}

fn join_type(seen: Arc<Mutex<Vec<u32>>>) -> NodeType {
    let schema = NodeSchema::new(
        vec![
            SlotDesc::input(0, "a", TypeTag::U32).execute_role(),
            SlotDesc::input(1, "b", TypeTag::U32).execute_role(),
        ],
        vec![],
    );
    NodeType::new("Join", schema, move |_| {
        Box::new(JoinNode {
            seen: Arc::clone(&seen),
        })
    })
}

/// Mutates a shared resource in place through a ReadWrite input.
struct ScaleInPlaceNode {
    factor: u32,
}

impl Node for ScaleInPlaceNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let current: u32 = ctx.input(0)?;
        ctx.write_input(0, current * self.factor)
    }
}

fn scale_type(name: &str, factor: u32) -> NodeType {
    let schema = NodeSchema::new(
        vec![SlotDesc::input(0, "target", TypeTag::U32)
            .execute_role()
            .mutability(SlotMutability::ReadWrite)],
        vec![],
    );
    NodeType::new(name, schema, move |_| Box::new(ScaleInPlaceNode { factor }))
}

fn build_graph(registry: NodeTypeRegistry) -> RenderGraph {
    let _ = pretty_env_logger::try_init();
    RenderGraph::new(
        Arc::new(registry),
        Arc::new(MessageBus::new()),
        Arc::new(Logger::new("test-graph")),
        None,
    )
}

fn level_nodes(levels: &[Vec<VirtualTaskId>]) -> Vec<Vec<NodeId>> {
    levels
        .iter()
        .map(|level| level.iter().map(|t| t.node).collect())
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Scenario 1: linear graph

#[test]
fn linear_graph_executes_in_order_and_forwards_values() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(source_type());
    registry.register_node_type(double_type());
    registry.register_node_type(sink_type(Arc::clone(&seen)));

    let mut graph = build_graph(registry);
    let a = graph.add_node("Source", "a").unwrap();
    let b = graph.add_node("Double", "b").unwrap();
    let c = graph.add_node("Sink", "c").unwrap();
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(b, 0, c, 0).unwrap();

    graph.compile().unwrap();
    assert_eq!(graph.execution_order(), &[a, b, c]);

    let levels = level_nodes(graph.executor().parallel_levels());
    assert_eq!(levels, vec![vec![a], vec![b], vec![c]]);

    let report = graph.render_frame().unwrap();
    assert!(report.success, "errors: {:?}", report.task_errors);
    assert_eq!(*seen.lock(), vec![84]);
}

//--------------------------------------------------------------------------------------------------
// Scenario 2: parallelisable diamond

#[test]
fn diamond_exposes_middle_level_parallelism() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(split_type());
    registry.register_node_type(double_type());
    registry.register_node_type(join_type(Arc::clone(&seen)));

    let mut graph = build_graph(registry);
    let a = graph.add_node("Split", "a").unwrap();
    let b = graph.add_node("Double", "b").unwrap();
    let c = graph.add_node("Double", "c").unwrap();
    let d = graph.add_node("Join", "d").unwrap();
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(a, 1, c, 0).unwrap();
    graph.connect(b, 0, d, 0).unwrap();
    graph.connect(c, 0, d, 1).unwrap();

    graph.compile().unwrap();

    let levels = level_nodes(graph.executor().parallel_levels());
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0], vec![a]);
    assert_eq!(levels[2], vec![d]);
    let mut middle = levels[1].clone();
    middle.sort();
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(middle, expected);

    let dep_graph = graph.executor().dependency_graph();
    let task_b = VirtualTaskId::new(b, 0);
    let task_c = VirtualTaskId::new(c, 0);
    assert!(dep_graph.can_parallelize(task_b, task_c));
    assert!(!dep_graph.has_dependency(task_b, task_c));
    assert!(!dep_graph.has_dependency(task_c, task_b));

    let report = graph.render_frame().unwrap();
    assert!(report.success);
    // left 1*2 + right 2*2
    assert_eq!(*seen.lock(), vec![6]);
}

//--------------------------------------------------------------------------------------------------
// Scenario 3: write-write conflict ordering

#[test]
fn write_write_conflict_orders_by_execution_index() {
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(source_type());
    registry.register_node_type(scale_type("ScaleTen", 10));
    registry.register_node_type(scale_type("ScaleThree", 3));

    let mut graph = build_graph(registry);
    let src = graph.add_node("Source", "src").unwrap();
    let first = graph.add_node("ScaleTen", "first").unwrap();
    let second = graph.add_node("ScaleThree", "second").unwrap();
    // Both scale nodes mutate the same resource through ReadWrite inputs.
    graph.connect(src, 0, first, 0).unwrap();
    graph.connect(src, 0, second, 0).unwrap();

    graph.compile().unwrap();

    let dep_graph = graph.executor().dependency_graph();
    let task_first = VirtualTaskId::new(first, 0);
    let task_second = VirtualTaskId::new(second, 0);
    assert!(dep_graph.has_dependency(task_first, task_second));
    let edge = dep_graph
        .edges()
        .iter()
        .find(|e| e.from == task_first && e.to == task_second)
        .expect("write-write edge exists");
    assert!(edge.is_write_write);

    let report = graph.render_frame().unwrap();
    assert!(report.success, "errors: {:?}", report.task_errors);
    // 42 * 10 * 3: the later node's write lands last.
    let final_value: u32 = graph.output_value(src, 0).unwrap();
    assert_eq!(final_value, 1260);
}

//--------------------------------------------------------------------------------------------------
// Scenario 4: cycle rejection is atomic

#[test]
fn cyclic_batch_rejected_atomically() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(double_type());
    registry.register_node_type(sink_type(seen));

    let mut graph = build_graph(registry);
    let a = graph.add_node("Double", "a").unwrap();
    let b = graph.add_node("Double", "b").unwrap();

    let mut batch = ConnectionBatch::new();
    batch.connect(a, 0, b, 0).connect(b, 0, a, 0);
    let err = graph.register_batch(batch).unwrap_err();
    assert!(matches!(err, GraphError::CycleDetected { .. }));

    // Nothing was applied: the same forward connection still succeeds with
    // a Single-arity input slot.
    graph.connect(a, 0, b, 0).unwrap();
    let err = graph.connect(a, 0, b, 0).unwrap_err();
    assert!(matches!(err, GraphError::SlotAlreadyConnected { .. }));
}

//--------------------------------------------------------------------------------------------------
// Construction errors

#[test]
fn construction_errors_surface_synchronously() {
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(source_type());
    registry.register_node_type(double_type());
    registry.register_node_type(
        NodeType::new(
            "Singleton",
            NodeSchema::new(vec![], vec![SlotDesc::output(0, "out", TypeTag::U32)]),
            |_| Box::new(SourceNode { value: 0 }),
        )
        .with_max_instances(1),
    );

    let mut graph = build_graph(registry);
    graph.add_node("Source", "a").unwrap();
    assert!(matches!(
        graph.add_node("Source", "a"),
        Err(GraphError::DuplicateInstanceName(_))
    ));
    assert!(matches!(
        graph.add_node("NoSuchType", "x"),
        Err(GraphError::UnknownNodeType(_))
    ));

    graph.add_node("Singleton", "s0").unwrap();
    assert!(matches!(
        graph.add_node("Singleton", "s1"),
        Err(GraphError::MaxInstancesExceeded { .. })
    ));
}

#[test]
fn type_mismatch_rejected_at_connect() {
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(source_type());
    let text_sink_schema = NodeSchema::new(
        vec![SlotDesc::input(0, "in", TypeTag::Text).execute_role()],
        vec![],
    );
    registry.register_node_type(NodeType::new("TextSink", text_sink_schema, |_| {
        Box::new(DoubleNode)
    }));

    let mut graph = build_graph(registry);
    let a = graph.add_node("Source", "a").unwrap();
    let b = graph.add_node("TextSink", "b").unwrap();
    assert!(matches!(
        graph.connect(a, 0, b, 0),
        Err(GraphError::ConnectionTypeMismatch { .. })
    ));
}

#[test]
fn missing_required_input_fails_validation() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(sink_type(seen));

    let mut graph = build_graph(registry);
    graph.add_node("Sink", "lonely").unwrap();
    assert!(matches!(
        graph.compile(),
        Err(GraphError::MissingRequiredInput { .. })
    ));
}

//--------------------------------------------------------------------------------------------------
// Dirty recompilation

struct CountingCompileNode {
    compiles: Arc<Mutex<u32>>,
}

impl Node for CountingCompileNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        *self.compiles.lock() += 1;
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        ctx.output(0, 7u32)
    }
}

#[test]
fn param_change_marks_dirty_and_recompiles_once() {
    let compiles = Arc::new(Mutex::new(0u32));
    let compiles2 = Arc::clone(&compiles);
    let mut registry = NodeTypeRegistry::new();
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    registry.register_node_type(NodeType::new("Counting", schema, move |_| {
        Box::new(CountingCompileNode {
            compiles: Arc::clone(&compiles2),
        })
    }));

    let mut graph = build_graph(registry);
    let n = graph.add_node("Counting", "n").unwrap();
    graph.compile().unwrap();
    assert_eq!(*compiles.lock(), 1);

    graph.render_frame().unwrap();
    assert_eq!(*compiles.lock(), 1);

    graph.set_param(n, "anything", 3u32).unwrap();
    assert_eq!(graph.node_state(n), Some(NodeState::Dirty));
    let report = graph.render_frame().unwrap();
    assert_eq!(report.recompiled_nodes, 1);
    assert_eq!(*compiles.lock(), 2);
    assert_eq!(graph.node_state(n), Some(NodeState::Complete));
}

//--------------------------------------------------------------------------------------------------
// Execution errors keep the graph usable

struct FailingExecuteNode {
    fail_frames: Arc<Mutex<u32>>,
}

impl Node for FailingExecuteNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let mut remaining = self.fail_frames.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(GraphError::NodeError(
                ctx.node_name().to_string(),
                String::from("transient device loss"),
            ));
        }
        ctx.output(0, 5u32)
    }
}

#[test]
fn failed_task_reports_and_recovers_next_frame() {
    let fail_frames = Arc::new(Mutex::new(1u32));
    let fail2 = Arc::clone(&fail_frames);
    let mut registry = NodeTypeRegistry::new();
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    registry.register_node_type(NodeType::new("Flaky", schema, move |_| {
        Box::new(FailingExecuteNode {
            fail_frames: Arc::clone(&fail2),
        })
    }));

    let mut graph = build_graph(registry);
    let n = graph.add_node("Flaky", "n").unwrap();
    graph.compile().unwrap();

    let report = graph.render_frame().unwrap();
    assert!(!report.success);
    assert_eq!(report.task_errors.len(), 1);
    assert_eq!(report.task_errors[0].task, VirtualTaskId::new(n, 0));
    assert_eq!(graph.node_state(n), Some(NodeState::Dirty));

    // Next frame recompiles the dirty node and executes cleanly.
    let report = graph.render_frame().unwrap();
    assert!(report.success, "errors: {:?}", report.task_errors);
    assert_eq!(graph.output_value::<u32>(n, 0).unwrap(), 5);
}

//--------------------------------------------------------------------------------------------------
// Compile errors mark dependents dirty, not errored

struct BrokenCompileNode;

impl Node for BrokenCompileNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Err(GraphError::NodeError(
            String::from("broken"),
            String::from("missing shader"),
        ))
    }
    fn execute(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
}

#[test]
fn compile_failure_marks_node_error_and_descendants_dirty() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    registry.register_node_type(NodeType::new("Broken", schema, |_| {
        Box::new(BrokenCompileNode)
    }));
    registry.register_node_type(sink_type(seen));

    let mut graph = build_graph(registry);
    let broken = graph.add_node("Broken", "broken").unwrap();
    let sink = graph.add_node("Sink", "sink").unwrap();
    graph.connect(broken, 0, sink, 0).unwrap();

    let err = graph.compile().unwrap_err();
    assert!(matches!(err, GraphError::PhaseFailed { .. }));
    assert_eq!(graph.node_state(broken), Some(NodeState::Error));
    assert_eq!(graph.node_state(sink), Some(NodeState::Dirty));
}

//--------------------------------------------------------------------------------------------------
// Accumulation arity

#[test]
fn accumulation_slot_collects_many_writers() {
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(source_type());

    struct GatherNode {
        total: Arc<Mutex<u32>>,
    }
    impl Node for GatherNode {
        fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
            Ok(())
        }
        fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
            let mut total = 0;
            for i in 0..ctx.input_count(0) {
                total += ctx.input_at::<u32>(0, i)?;
            }
            *self.total.lock() = total;
            Ok(())
        }
    }

    let total = Arc::new(Mutex::new(0u32));
    let total2 = Arc::clone(&total);
    let schema = NodeSchema::new(
        vec![SlotDesc::input(0, "items", TypeTag::U32)
            .execute_role()
            .array_mode(rendergraph::SlotArrayMode::Accumulation)],
        vec![],
    );
    registry.register_node_type(NodeType::new("Gather", schema, move |_| {
        Box::new(GatherNode {
            total: Arc::clone(&total2),
        })
    }));

    let mut graph = build_graph(registry);
    let s1 = graph.add_node("Source", "s1").unwrap();
    let s2 = graph.add_node("Source", "s2").unwrap();
    let s3 = graph.add_node("Source", "s3").unwrap();
    let gather = graph.add_node("Gather", "gather").unwrap();
    graph.connect(s1, 0, gather, 0).unwrap();
    graph.connect(s2, 0, gather, 0).unwrap();
    graph.connect(s3, 0, gather, 0).unwrap();

    graph.compile().unwrap();
    let report = graph.render_frame().unwrap();
    assert!(report.success, "errors: {:?}", report.task_errors);
    assert_eq!(*total.lock(), 126);
}
