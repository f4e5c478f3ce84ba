//! Data-driven render graph runtime.
//!
//! Turns a declarative, typed graph of compute/render nodes into a
//! validated, compiled, repeatedly executable pipeline:
//! * typed slots over a variant-backed `Resource`, owned by an arena
//! * four-phase node lifecycle (Setup, Compile, Execute, Cleanup) with
//!   deferred recompilation driven by invalidation events
//! * virtual tasks (`node` x `bundle`) scheduled on a work-stealing pool
//!   from a resource-conflict dependency DAG
//! * adaptive task profiles with pressure valves and a capacity tracker
//!   keeping frame budgets
//! * a thread-safe event bus with a worker-thread bridge for blocking work
//!
//! The core performs no GPU work itself; graphics-API collaborators sit
//! behind the traits in [`interop`].

pub mod error;
pub mod events;
pub mod graph;
pub mod interop;
pub mod logger;
pub mod node;
pub mod nodes;
pub mod profile;
pub mod registry;
pub mod resource;
pub mod settings;
pub mod slots;
pub mod tasks;
pub mod topology;

pub use crate::error::{GraphError, GraphResult};
pub use crate::events::{EventCategory, MessageBus, SenderId, WorkerBridge};
pub use crate::graph::{
    CleanupHandle, FrameReport, LoopCatchupMode, LoopConfig, LoopManager, LoopReference,
    NodeId, RenderGraph,
};
pub use crate::logger::Logger;
pub use crate::node::{BundleSpec, Node, NodeCtx, NodeState, ParamValue};
pub use crate::profile::{
    CapacityTracker, ResolutionTaskProfile, Sampler, SharedProfile, SimpleTaskProfile,
    TaskProfile, TaskProfileRegistry,
};
pub use crate::registry::{NodeType, NodeTypeRegistry, RegisterableNode};
pub use crate::resource::{
    Resource, ResourceData, ResourceId, ResourceLifetime, ResourceValue, TypeTag,
};
pub use crate::settings::GraphSettings;
pub use crate::slots::{
    NodeSchema, SlotArrayMode, SlotDesc, SlotMutability, SlotNullability, SlotRole, SlotScope,
};
pub use crate::tasks::{TaskPhase, VirtualTaskId};
pub use crate::topology::ConnectionBatch;
