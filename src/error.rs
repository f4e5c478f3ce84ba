//! Error type.
//!
//! This is the shared error type for the whole crate. Construction and
//! validation errors surface synchronously and leave the graph unchanged;
//! compile and execution errors are recorded per node/task and never abort
//! the surrounding phase.

use thiserror::Error;

use crate::resource::TypeTag;
use crate::tasks::TaskPhase;

#[derive(Clone, Debug, Error)]
pub enum GraphError {
    //---------------------------------------------------------------------
    // Construction
    #[error("instance name already exists: {0}")]
    DuplicateInstanceName(String),
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),
    #[error("max instance count reached for type {type_name} ({max})")]
    MaxInstancesExceeded { type_name: String, max: u32 },
    #[error("invalid node handle")]
    InvalidNodeHandle,
    #[error("node {node}: invalid {kind} slot index {index}")]
    InvalidSlotIndex {
        node: String,
        kind: &'static str,
        index: u32,
    },
    #[error("type mismatch connecting {source_node}.{source_slot} ({source_tag:?}) to {target}.{target_slot} ({target_tag:?})")]
    ConnectionTypeMismatch {
        source_node: String,
        source_slot: String,
        source_tag: TypeTag,
        target: String,
        target_slot: String,
        target_tag: TypeTag,
    },
    #[error("slot {node}.{slot} accepts a single connection")]
    SlotAlreadyConnected { node: String, slot: String },

    //---------------------------------------------------------------------
    // Validation
    #[error("graph contains a cycle through: {}", .nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },
    #[error("node {node} missing required input {slot}")]
    MissingRequiredInput { node: String, slot: String },
    #[error("image format mismatch on {node}.{slot}: schema {expected}, resource {actual}")]
    FormatMismatch {
        node: String,
        slot: String,
        expected: String,
        actual: String,
    },
    #[error("graph validation failed: {0}")]
    ValidationFailed(String),

    //---------------------------------------------------------------------
    // Resources
    #[error("resource type mismatch: expected {expected:?}, found {actual:?}")]
    ResourceTypeMismatch { expected: TypeTag, actual: TypeTag },
    #[error("resource not written this frame (transient read before write)")]
    ResourceNotWritten,
    #[error("unknown resource id")]
    UnknownResource,
    #[error("slot {slot} is not readable during the {phase:?} phase")]
    SlotNotReadableInPhase { slot: String, phase: TaskPhase },
    #[error("slot {slot} is read-only")]
    SlotNotWritable { slot: String },
    #[error("input slot {slot} has no connection at index {index}")]
    InputNotConnected { slot: String, index: usize },

    //---------------------------------------------------------------------
    // Parameters
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("parameter {name} has type {actual}, requested {expected}")]
    ParameterTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    //---------------------------------------------------------------------
    // Compile / execute
    #[error("graph must be compiled before {0}")]
    NotCompiled(&'static str),
    #[error("node {node} failed to compile: {message}")]
    NodeCompileFailed { node: String, message: String },
    #[error("{failed} task(s) failed during the {phase:?} phase")]
    PhaseFailed { phase: TaskPhase, failed: usize },
    #[error("dependency edge would create a cycle")]
    TaskCycle,
    #[error("node {0} error: {1}")]
    NodeError(String, String),

    //---------------------------------------------------------------------
    // Profiles / persistence
    #[error("no profile factory registered for type {0}")]
    UnknownProfileType(String),
    #[error("profile {name} already registered with a different type")]
    ProfileTypeConflict { name: String },
    #[error("profile state malformed: {0}")]
    ProfileStateMalformed(String),
    #[error("i/o error: {0}")]
    Io(String),

    //---------------------------------------------------------------------
    // Loops
    #[error("unknown loop id: {0}")]
    UnknownLoop(u32),
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::ProfileStateMalformed(err.to_string())
    }
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;
