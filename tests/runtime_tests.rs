//! Runtime behaviors that cross component boundaries: loop bridging,
//! constant injection, event-driven invalidation, profile persistence and
//! the capacity valve, shutdown coordination.

use std::sync::Arc;

use parking_lot::Mutex;

use rendergraph::events::{
    CleanupCompletedMessage, CleanupRequestedMessage, ShutdownAckMessage,
    WindowCloseRequestedMessage, WindowResizedMessage,
};
use rendergraph::node::{Node, NodeCtx};
use rendergraph::nodes::{register_builtin_node_types, ConstantNode};
use rendergraph::registry::NodeType;
use rendergraph::{
    CapacityTracker, GraphResult, Logger, LoopConfig, MessageBus, NodeSchema, NodeState,
    NodeTypeRegistry, RenderGraph, ResolutionTaskProfile, SimpleTaskProfile, SlotDesc,
    TaskProfileRegistry, TypeTag,
};

fn build_graph_with_bus(registry: NodeTypeRegistry, bus: Arc<MessageBus>) -> RenderGraph {
    let _ = pretty_env_logger::try_init();
    RenderGraph::new(
        Arc::new(registry),
        bus,
        Arc::new(Logger::new("runtime-test")),
        None,
    )
}

//--------------------------------------------------------------------------------------------------
// Loop bridge

/// Counts how often it ran while its gate input was true.
struct GatedNode {
    executed_steps: Arc<Mutex<u32>>,
}

impl Node for GatedNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        let should_execute: bool = ctx.input(0)?;
        let delta: f64 = ctx.input(1)?;
        if should_execute {
            assert!(delta > 0.0);
            *self.executed_steps.lock() += 1;
        }
        Ok(())
    }
}

#[test]
fn loop_bridge_gates_downstream_work() {
    let executed = Arc::new(Mutex::new(0u32));
    let executed2 = Arc::clone(&executed);
    let mut registry = NodeTypeRegistry::new();
    register_builtin_node_types(&mut registry);
    let schema = NodeSchema::new(
        vec![
            SlotDesc::input(0, "should_execute", TypeTag::Bool).execute_role(),
            SlotDesc::input(1, "delta", TypeTag::F64).execute_role(),
        ],
        vec![],
    );
    registry.register_node_type(NodeType::new("Gated", schema, move |_| {
        Box::new(GatedNode {
            executed_steps: Arc::clone(&executed2),
        })
    }));

    let mut graph = build_graph_with_bus(registry, Arc::new(MessageBus::new()));
    // A loop so slow it cannot fire within this test's runtime.
    let slow_loop = graph.register_loop(LoopConfig::new(1000.0, "slow"));
    let bridge = graph.add_node("LoopBridge", "bridge").unwrap();
    graph.set_param(bridge, "loopId", slow_loop).unwrap();
    let gated = graph.add_node("Gated", "gated").unwrap();
    graph.connect(bridge, 0, gated, 0).unwrap();
    graph.connect(bridge, 1, gated, 1).unwrap();

    graph.compile().unwrap();
    for _ in 0..3 {
        let report = graph.render_frame().unwrap();
        assert!(report.success, "errors: {:?}", report.task_errors);
    }
    // The 1000-second loop never accumulated a full step.
    assert_eq!(*executed.lock(), 0);
}

#[test]
fn loop_reference_address_is_stable() {
    let mut registry = NodeTypeRegistry::new();
    register_builtin_node_types(&mut registry);
    let mut graph = build_graph_with_bus(registry, Arc::new(MessageBus::new()));

    let id = graph.register_loop(LoopConfig::new(1.0 / 60.0, "physics"));
    let before = graph.loop_reference(id).unwrap() as *const _;
    for i in 0..32 {
        graph.register_loop(LoopConfig::new(0.0, format!("l{i}")));
    }
    graph.update_time();
    let after = graph.loop_reference(id).unwrap() as *const _;
    assert_eq!(before, after);
}

//--------------------------------------------------------------------------------------------------
// Constant node

/// Consumes a text constant during compile (dependency role).
struct LabelNode {
    seen: Arc<Mutex<String>>,
}

impl Node for LabelNode {
    fn compile(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        *self.seen.lock() = ctx.input::<String>(0)?;
        Ok(())
    }
    fn execute(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
}

#[test]
fn constant_injects_value_and_registers_cleanup() {
    let seen = Arc::new(Mutex::new(String::new()));
    let seen2 = Arc::clone(&seen);
    let cleaned = Arc::new(Mutex::new(false));
    let cleaned2 = Arc::clone(&cleaned);

    let mut registry = NodeTypeRegistry::new();
    register_builtin_node_types(&mut registry);
    let schema = NodeSchema::new(
        vec![SlotDesc::input(0, "label", TypeTag::Text)],
        vec![],
    );
    registry.register_node_type(NodeType::new("Label", schema, move |_| {
        Box::new(LabelNode {
            seen: Arc::clone(&seen2),
        })
    }));

    let mut graph = build_graph_with_bus(registry, Arc::new(MessageBus::new()));
    let constant = graph.add_node("Constant.Text", "title").unwrap();
    graph
        .with_node::<ConstantNode, _>(constant, |node| {
            node.set_value(String::from("voxels"));
            node.set_cleanup(move || *cleaned2.lock() = true, vec![]);
        })
        .unwrap();
    let label = graph.add_node("Label", "label").unwrap();
    graph.connect(constant, 0, label, 0).unwrap();

    graph.compile().unwrap();
    assert_eq!(*seen.lock(), "voxels");
    assert!(!*cleaned.lock());

    graph.clear();
    assert!(*cleaned.lock());
}

//--------------------------------------------------------------------------------------------------
// Event-driven invalidation

struct ImageProducerNode {
    compiles: Arc<Mutex<u32>>,
}

impl Node for ImageProducerNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        *self.compiles.lock() += 1;
        Ok(())
    }
    fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
        ctx.output_raw(
            0,
            rendergraph::ResourceValue::Image {
                desc: rendergraph::resource::ImageDescription {
                    width: 800,
                    height: 600,
                    ..Default::default()
                },
                handle: Some(7),
            },
        )
    }
}

#[test]
fn window_resize_recompiles_image_producers_without_teardown() {
    let compiles = Arc::new(Mutex::new(0u32));
    let compiles2 = Arc::clone(&compiles);
    let mut registry = NodeTypeRegistry::new();
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "image", TypeTag::Image)],
    );
    registry.register_node_type(NodeType::new("ImageProducer", schema, move |_| {
        Box::new(ImageProducerNode {
            compiles: Arc::clone(&compiles2),
        })
    }));

    let bus = Arc::new(MessageBus::new());
    let mut graph = build_graph_with_bus(registry, Arc::clone(&bus));
    let producer = graph.add_node("ImageProducer", "producer").unwrap();
    graph.compile().unwrap();
    assert_eq!(*compiles.lock(), 1);

    graph.render_frame().unwrap();
    assert_eq!(*compiles.lock(), 1);

    bus.publish(WindowResizedMessage::new(0, 1920, 1080));
    let report = graph.render_frame().unwrap();
    assert!(report.success, "errors: {:?}", report.task_errors);
    assert_eq!(report.recompiled_nodes, 1);
    assert_eq!(*compiles.lock(), 2);
    // Still compiled; no teardown happened.
    assert!(graph.is_compiled());
    assert_eq!(graph.node_state(producer), Some(NodeState::Complete));
}

#[test]
fn shader_reload_marks_watched_subtree_dirty() {
    let compiles = Arc::new(Mutex::new(0u32));
    let compiles2 = Arc::clone(&compiles);
    let mut registry = NodeTypeRegistry::new();
    let schema = NodeSchema::new(
        vec![],
        vec![SlotDesc::output(0, "out", TypeTag::U32).transient()],
    );
    registry.register_node_type(NodeType::new("Pipe", schema, move |_| {
        struct PipeNode {
            compiles: Arc<Mutex<u32>>,
        }
        impl Node for PipeNode {
            fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
                *self.compiles.lock() += 1;
                Ok(())
            }
            fn execute(&mut self, ctx: &NodeCtx) -> GraphResult<()> {
                ctx.output(0, 1u32)
            }
        }
        Box::new(PipeNode {
            compiles: Arc::clone(&compiles2),
        })
    }));

    let bus = Arc::new(MessageBus::new());
    let mut graph = build_graph_with_bus(registry, Arc::clone(&bus));
    let pipe = graph.add_node("Pipe", "pipe").unwrap();
    graph.watch_shader(pipe, "shaders/raymarch.comp");
    graph.compile().unwrap();
    graph.render_frame().unwrap();
    assert_eq!(*compiles.lock(), 1);

    bus.publish(rendergraph::events::ShaderReloadedMessage::new(
        0,
        "shaders/raymarch.comp",
    ));
    graph.render_frame().unwrap();
    assert_eq!(*compiles.lock(), 2);

    // An unrelated path leaves the node alone.
    bus.publish(rendergraph::events::ShaderReloadedMessage::new(
        0,
        "shaders/other.comp",
    ));
    graph.render_frame().unwrap();
    assert_eq!(*compiles.lock(), 2);
}

//--------------------------------------------------------------------------------------------------
// Shutdown coordination

#[test]
fn window_close_publishes_cleanup_request_and_collects_acks() {
    let registry = NodeTypeRegistry::new();
    let bus = Arc::new(MessageBus::new());

    let requests = Arc::new(Mutex::new(0u32));
    let requests2 = Arc::clone(&requests);
    bus.subscribe(CleanupRequestedMessage::TYPE, move |_| {
        *requests2.lock() += 1;
        true
    });
    let completions = Arc::new(Mutex::new(Vec::new()));
    let completions2 = Arc::clone(&completions);
    bus.subscribe(CleanupCompletedMessage::TYPE, move |msg| {
        if let Some(done) = msg.downcast_ref::<CleanupCompletedMessage>() {
            completions2.lock().push(done.cleaned_count);
        }
        true
    });

    let mut graph = build_graph_with_bus(registry, Arc::clone(&bus));
    bus.publish(WindowCloseRequestedMessage::new(9));
    graph.process_events();
    assert!(graph.is_shutdown_requested());

    // The graph's own CleanupRequested lands on the next drain, and the
    // completion message on the drain after that.
    graph.process_events();
    assert_eq!(*requests.lock(), 1);
    graph.process_events();
    assert!(!completions.lock().is_empty());

    bus.publish(ShutdownAckMessage::new(3, "voxel-streamer"));
    graph.process_events();
    assert_eq!(graph.shutdown_acks(), &[String::from("voxel-streamer")]);
}

//--------------------------------------------------------------------------------------------------
// Scenario 6: profile persistence across registries

#[test]
fn resolution_profile_persists_across_registries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");

    {
        let mut registry = TaskProfileRegistry::new();
        let shared = registry.insert(ResolutionTaskProfile::with_default_table(
            "raymarch", "render",
        ));
        {
            let guard = shared.read();
            guard.record_measurement(1_000_000);
        }
        shared.write().process_samples();
        shared.write().set_work_units(2);
        {
            let guard = shared.read();
            guard.record_measurement(3_500_000);
        }
        shared.write().process_samples();
        shared.write().set_work_units(0);
        registry.save_to_file(&path).unwrap();
    }

    // Fresh process-wide registry: factories must be registered first.
    let mut restored = TaskProfileRegistry::new();
    restored.register_builtin_factories();
    assert_eq!(restored.load_from_file(&path).unwrap(), 1);

    let shared = restored.get("raymarch").unwrap();
    let guard = shared.read();
    let profile = guard
        .downcast_ref::<ResolutionTaskProfile>()
        .expect("restored as resolution profile");
    assert_eq!(profile.measured_cost_at_level(0), 1_000_000);
    assert_eq!(profile.measured_cost_at_level(2), 3_500_000);
    drop(guard);

    // Quadratic extrapolation at the top level: 4096^2 / 1024^2 = 16x.
    shared.write().set_work_units(5);
    assert_eq!(shared.read().estimated_cost_ns(), 16_000_000);
}

//--------------------------------------------------------------------------------------------------
// Capacity tracker drives the valves through the graph frame loop

struct BusyNode;

impl Node for BusyNode {
    fn compile(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
    fn execute(&mut self, _ctx: &NodeCtx) -> GraphResult<()> {
        Ok(())
    }
}

#[test]
fn over_budget_frame_decreases_work_units() {
    let mut registry = NodeTypeRegistry::new();
    let schema = NodeSchema::new(vec![], vec![]);
    registry.register_node_type(NodeType::new("Busy", schema, |_| Box::new(BusyNode)));

    let mut graph = build_graph_with_bus(registry, Arc::new(MessageBus::new()));
    let node = graph.add_node("Busy", "busy").unwrap();

    let shared = {
        let profiles = graph.profiles_mut();
        let shared = profiles
            .get_or_create::<SimpleTaskProfile>("busy.execute", "frame")
            .unwrap();
        shared
            .write()
            .downcast_mut::<SimpleTaskProfile>()
            .unwrap()
            .set_baseline_cost_ns(20_000_000);
        shared
    };
    graph.attach_profile(node, 0, Arc::clone(&shared)).unwrap();
    // 10ms budget against a 20ms estimate.
    graph.add_capacity_tracker(CapacityTracker::new(Some("frame"), 10_000_000));

    graph.compile().unwrap();
    graph.render_frame().unwrap();
    assert_eq!(shared.read().work_units(), -1);
    graph.render_frame().unwrap();
    assert_eq!(shared.read().work_units(), -2);
}
