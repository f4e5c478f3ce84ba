//! Scheduling properties observed through real execution: conservative
//! ordering across dependency edges, writer exclusion, bundle-level
//! parallelism, and serialization of opt-out nodes.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use rendergraph::node::{BundleSpec, Node, NodeCtx};
use rendergraph::registry::NodeType;
use rendergraph::{
    GraphResult, Logger, MessageBus, NodeSchema, NodeTypeRegistry, RenderGraph, SlotDesc,
    TypeTag, VirtualTaskId,
};

/// Wall-clock interval observed for one task execution.
#[derive(Clone, Copy, Debug)]
struct Span {
    start: Instant,
    end: Instant,
}

type SpanLog = Arc<Mutex<Vec<(String, Span)>>>;

/// Node that records its execution interval, with a small busy wait so
/// overlaps are observable.
struct TracedNode {
    name: String,
    log: SpanLog,
}

impl Node for TracedNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let start = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        ctx.output(0, 1u32)?;
        self.log.lock().push((
            self.name.clone(),
            Span {
                start,
                end: Instant::now(),
            },
        ));
        Ok(())
    }
}

fn traced_type(type_name: &str, log: SpanLog) -> NodeType {
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    NodeType::new(type_name, schema, move |instance| {
        Box::new(TracedNode {
            name: instance.to_string(),
            log: Arc::clone(&log),
        })
    })
}

/// Traced consumer with one input.
struct TracedConsumer {
    name: String,
    log: SpanLog,
}

impl Node for TracedConsumer {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let start = Instant::now();
        let _: u32 = ctx.input(0)?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        self.log.lock().push((
            self.name.clone(),
            Span {
                start,
                end: Instant::now(),
            },
        ));
        Ok(())
    }
}

fn consumer_type(type_name: &str, log: SpanLog) -> NodeType {
    let schema = NodeSchema::new(
        vec![SlotDesc::input(0, "in", TypeTag::U32).execute_role()],
        vec![],
    );
    NodeType::new(type_name, schema, move |instance| {
        Box::new(TracedConsumer {
            name: instance.to_string(),
            log: Arc::clone(&log),
        })
    })
}

fn span_of(log: &SpanLog, name: &str) -> Span {
    log.lock()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, s)| *s)
        .unwrap_or_else(|| panic!("no span recorded for {name}"))
}

fn build_graph(registry: NodeTypeRegistry) -> RenderGraph {
    RenderGraph::new(
        Arc::new(registry),
        Arc::new(MessageBus::new()),
        Arc::new(Logger::new("sched-test")),
        None,
    )
}

//--------------------------------------------------------------------------------------------------

/// P2/P4: across every dependency edge, the producer's end precedes the
/// consumer's start.
#[test]
fn dependency_edges_are_conservative() {
    let log: SpanLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(traced_type("Producer", Arc::clone(&log)));
    registry.register_node_type(consumer_type("Consumer", Arc::clone(&log)));

    let mut graph = build_graph(registry);
    let producer = graph.add_node("Producer", "producer").unwrap();
    let consumer_a = graph.add_node("Consumer", "consumer_a").unwrap();
    let consumer_b = graph.add_node("Consumer", "consumer_b").unwrap();
    graph.connect(producer, 0, consumer_a, 0).unwrap();
    graph.connect(producer, 0, consumer_b, 0).unwrap();

    graph.compile().unwrap();
    let report = graph.render_frame().unwrap();
    assert!(report.success, "errors: {:?}", report.task_errors);

    let producer_span = span_of(&log, "producer");
    for consumer in ["consumer_a", "consumer_b"] {
        let consumer_span = span_of(&log, consumer);
        assert!(
            producer_span.end <= consumer_span.start,
            "producer overlapped {consumer}"
        );
    }
}

/// P1: the built dependency graph is acyclic for a mesh of overlapping
/// producer/consumer chains.
#[test]
fn built_schedule_has_no_cycles() {
    let log: SpanLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(traced_type("Producer", Arc::clone(&log)));
    registry.register_node_type(consumer_type("Consumer", Arc::clone(&log)));

    let mut graph = build_graph(registry);
    let mut producers = Vec::new();
    for i in 0..4 {
        producers.push(graph.add_node("Producer", &format!("p{i}")).unwrap());
    }
    for i in 0..8 {
        let consumer = graph.add_node("Consumer", &format!("c{i}")).unwrap();
        graph.connect(producers[i % 4], 0, consumer, 0).unwrap();
    }

    graph.compile().unwrap();
    assert!(!graph.executor().dependency_graph().has_cycle());
    assert!(graph.executor().dependency_graph().critical_path_length() >= 2);
    assert!(graph.executor().dependency_graph().max_parallelism() >= 4);
}

//--------------------------------------------------------------------------------------------------
// Bundles

/// Node with two independent bundles writing separate outputs.
struct TwoBundleNode {
    log: SpanLog,
}

impl Node for TwoBundleNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let start = Instant::now();
        ctx.output(ctx.bundle(), ctx.bundle() + 100)?;
        self.log.lock().push((
            format!("bundle{}", ctx.bundle()),
            Span {
                start,
                end: Instant::now(),
            },
        ));
        Ok(())
    }
    fn bundles(&self, _schema: &NodeSchema) -> Vec<BundleSpec> {
        // Bundle 0 writes output 0, bundle 1 writes output 1.
        vec![BundleSpec::new([], [0]), BundleSpec::new([], [1])]
    }
}

#[test]
fn independent_bundles_share_a_level() {
    let log: SpanLog = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);
    let mut registry = NodeTypeRegistry::new();
    let schema = NodeSchema::new(
        vec![],
        vec![
            SlotDesc::output(0, "left", TypeTag::U32).transient(),
            SlotDesc::output(1, "right", TypeTag::U32).transient(),
        ],
    );
    registry.register_node_type(NodeType::new("TwoBundle", schema, move |_| {
        Box::new(TwoBundleNode {
            log: Arc::clone(&log2),
        })
    }));

    let mut graph = build_graph(registry);
    let node = graph.add_node("TwoBundle", "node").unwrap();
    graph.compile().unwrap();

    // Both bundles land in the same parallel level.
    let levels = graph.executor().parallel_levels();
    assert_eq!(levels.len(), 1);
    let mut tasks = levels[0].clone();
    tasks.sort();
    assert_eq!(
        tasks,
        vec![VirtualTaskId::new(node, 0), VirtualTaskId::new(node, 1)]
    );

    let report = graph.render_frame().unwrap();
    assert!(report.success, "errors: {:?}", report.task_errors);
    assert_eq!(graph.output_value::<u32>(node, 0).unwrap(), 100);
    assert_eq!(graph.output_value::<u32>(node, 1).unwrap(), 101);
}

//--------------------------------------------------------------------------------------------------
// Opt-out serialization

struct SerialNode;

impl Node for SerialNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        ctx.output(0, 1u32)
    }
    fn parallelizable(&self) -> bool {
        false
    }
}

#[test]
fn non_parallelizable_nodes_get_private_levels() {
    let log: SpanLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = NodeTypeRegistry::new();
    registry.register_node_type(traced_type("Producer", Arc::clone(&log)));
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    registry.register_node_type(NodeType::new("Serial", schema, |_| Box::new(SerialNode)));

    let mut graph = build_graph(registry);
    let serial = graph.add_node("Serial", "serial").unwrap();
    let p0 = graph.add_node("Producer", "p0").unwrap();
    let p1 = graph.add_node("Producer", "p1").unwrap();
    graph.compile().unwrap();

    // The serial task sits alone in its level; the others may share.
    let levels = graph.executor().parallel_levels();
    let serial_task = VirtualTaskId::new(serial, 0);
    let serial_level = levels
        .iter()
        .find(|level| level.contains(&serial_task))
        .expect("serial task scheduled");
    assert_eq!(serial_level.len(), 1);

    let all: Vec<VirtualTaskId> = levels.iter().flatten().copied().collect();
    assert!(all.contains(&VirtualTaskId::new(p0, 0)));
    assert!(all.contains(&VirtualTaskId::new(p1, 0)));
}
