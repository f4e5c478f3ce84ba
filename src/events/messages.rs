//! Concrete message types.
//!
//! Type id assignments are part of the external interface and must not
//! change: 104 window resize, 105 shader reload, 106/107 cleanup
//! request/complete, 200-299 shader management.

use std::sync::Arc;

use super::{core_types, EventCategory, EventMessage, MessageType, SenderId};
use crate::interop::ShaderBundle;

macro_rules! impl_event_message {
    ($ty:ty) => {
        impl EventMessage for $ty {
            fn message_type(&self) -> MessageType {
                Self::TYPE
            }
            fn categories(&self) -> EventCategory {
                Self::CATEGORIES
            }
            fn sender(&self) -> SenderId {
                self.sender
            }
        }
    };
}

//--------------------------------------------------------------------------------------------------
// Core messages (0-99)

/// Untyped placeholder message, mostly useful in tests.
#[derive(Debug)]
pub struct GenericMessage {
    pub sender: SenderId,
}

impl GenericMessage {
    pub const TYPE: MessageType = core_types::GENERIC;
    pub const CATEGORIES: EventCategory = EventCategory::APPLICATION_STATE;

    pub fn new(sender: SenderId) -> GenericMessage {
        GenericMessage { sender }
    }
}

impl_event_message!(GenericMessage);

/// The user asked the window to close; the orchestrator answers with a
/// cleanup request and waits for acks.
#[derive(Debug)]
pub struct WindowCloseRequestedMessage {
    pub sender: SenderId,
}

impl WindowCloseRequestedMessage {
    pub const TYPE: MessageType = core_types::WINDOW_CLOSE_REQUESTED;
    pub const CATEGORIES: EventCategory = EventCategory::APPLICATION_STATE;

    pub fn new(sender: SenderId) -> WindowCloseRequestedMessage {
        WindowCloseRequestedMessage { sender }
    }
}

impl_event_message!(WindowCloseRequestedMessage);

/// A registered system acknowledges a shutdown request. Ack timeouts are the
/// application's concern, not the core's.
#[derive(Debug)]
pub struct ShutdownAckMessage {
    pub sender: SenderId,
    pub system_name: String,
}

impl ShutdownAckMessage {
    pub const TYPE: MessageType = core_types::SHUTDOWN_ACK;
    pub const CATEGORIES: EventCategory = EventCategory::APPLICATION_STATE;

    pub fn new(sender: SenderId, system_name: impl Into<String>) -> ShutdownAckMessage {
        ShutdownAckMessage {
            sender,
            system_name: system_name.into(),
        }
    }
}

impl_event_message!(ShutdownAckMessage);

//--------------------------------------------------------------------------------------------------
// Render graph messages (100-199)

/// Rendering pause/resume around swapchain recreation or resource
/// reallocation.
#[derive(Debug)]
pub struct RenderPauseMessage {
    pub sender: SenderId,
    pub reason: RenderPauseReason,
    pub action: RenderPauseAction,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RenderPauseReason {
    SwapchainRecreation,
    ResourceReallocation,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RenderPauseAction {
    PauseStart,
    PauseEnd,
}

impl RenderPauseMessage {
    pub const TYPE: MessageType = 103;
    pub const CATEGORIES: EventCategory = EventCategory::GRAPH_MANAGEMENT;

    pub fn new(
        sender: SenderId,
        reason: RenderPauseReason,
        action: RenderPauseAction,
    ) -> RenderPauseMessage {
        RenderPauseMessage {
            sender,
            reason,
            action,
        }
    }
}

impl_event_message!(RenderPauseMessage);

/// Window dimensions changed. Handled by the graph with a targeted recompile
/// of the affected subtree, never a full teardown.
#[derive(Debug)]
pub struct WindowResizedMessage {
    pub sender: SenderId,
    pub new_width: u32,
    pub new_height: u32,
}

impl WindowResizedMessage {
    pub const TYPE: MessageType = 104;
    pub const CATEGORIES: EventCategory = EventCategory::RESOURCE_INVALIDATION
        .union(EventCategory::WINDOW_RESIZE);

    pub fn new(sender: SenderId, width: u32, height: u32) -> WindowResizedMessage {
        WindowResizedMessage {
            sender,
            new_width: width,
            new_height: height,
        }
    }
}

impl_event_message!(WindowResizedMessage);

/// Shader file changed on disk; pipelines built from it must recompile.
#[derive(Debug)]
pub struct ShaderReloadedMessage {
    pub sender: SenderId,
    pub shader_path: String,
}

impl ShaderReloadedMessage {
    pub const TYPE: MessageType = 105;
    pub const CATEGORIES: EventCategory = EventCategory::RESOURCE_INVALIDATION
        .union(EventCategory::SHADER_HOT_RELOAD);

    pub fn new(sender: SenderId, path: impl Into<String>) -> ShaderReloadedMessage {
        ShaderReloadedMessage {
            sender,
            shader_path: path.into(),
        }
    }
}

impl_event_message!(ShaderReloadedMessage);

#[derive(Debug)]
pub struct CleanupRequestedMessage {
    pub sender: SenderId,
    pub request_id: u32,
}

impl CleanupRequestedMessage {
    pub const TYPE: MessageType = 106;
    pub const CATEGORIES: EventCategory = EventCategory::CLEANUP_REQUEST;

    pub fn new(sender: SenderId, request_id: u32) -> CleanupRequestedMessage {
        CleanupRequestedMessage { sender, request_id }
    }
}

impl_event_message!(CleanupRequestedMessage);

#[derive(Debug)]
pub struct CleanupCompletedMessage {
    pub sender: SenderId,
    pub cleaned_count: u32,
}

impl CleanupCompletedMessage {
    pub const TYPE: MessageType = 107;
    pub const CATEGORIES: EventCategory = EventCategory::CLEANUP_REQUEST;

    pub fn new(sender: SenderId, cleaned_count: u32) -> CleanupCompletedMessage {
        CleanupCompletedMessage {
            sender,
            cleaned_count,
        }
    }
}

impl_event_message!(CleanupCompletedMessage);

//--------------------------------------------------------------------------------------------------
// Shader management messages (200-299)

pub mod shader_types {
    use super::MessageType;

    pub const COMPILATION_STARTED: MessageType = 200;
    pub const COMPILATION_PROGRESS: MessageType = 201;
    pub const COMPILATION_COMPLETED: MessageType = 202;
    pub const COMPILATION_FAILED: MessageType = 203;
    pub const HOT_RELOAD_READY: MessageType = 206;
}

#[derive(Debug)]
pub struct ShaderCompilationStartedMessage {
    pub sender: SenderId,
    pub program_name: String,
    pub stage_count: u32,
}

impl ShaderCompilationStartedMessage {
    pub const TYPE: MessageType = shader_types::COMPILATION_STARTED;
    pub const CATEGORIES: EventCategory = EventCategory::SHADER_HOT_RELOAD;

    pub fn new(
        sender: SenderId,
        program_name: impl Into<String>,
        stage_count: u32,
    ) -> ShaderCompilationStartedMessage {
        ShaderCompilationStartedMessage {
            sender,
            program_name: program_name.into(),
            stage_count,
        }
    }
}

impl_event_message!(ShaderCompilationStartedMessage);

#[derive(Debug)]
pub struct ShaderCompilationProgressMessage {
    pub sender: SenderId,
    pub program_name: String,
    pub current_stage: String,
    pub completed_stages: u32,
    pub total_stages: u32,
}

impl ShaderCompilationProgressMessage {
    pub const TYPE: MessageType = shader_types::COMPILATION_PROGRESS;
    pub const CATEGORIES: EventCategory = EventCategory::SHADER_HOT_RELOAD;

    pub fn progress_percent(&self) -> f32 {
        if self.total_stages == 0 {
            0.0
        } else {
            self.completed_stages as f32 / self.total_stages as f32
        }
    }
}

impl_event_message!(ShaderCompilationProgressMessage);

/// Successful compilation result carrying the opaque bundle. Built to travel
/// over the worker bridge; `from_failure` produces the failed variant.
pub struct ShaderCompilationCompletedMessage {
    pub sender: SenderId,
    pub work_id: u64,
    pub program_name: String,
    pub bundle: Option<Arc<dyn ShaderBundle>>,
    pub used_cache: bool,
    pub warnings: Vec<String>,
    pub success: bool,
    pub error: String,
}

impl ShaderCompilationCompletedMessage {
    pub const TYPE: MessageType = shader_types::COMPILATION_COMPLETED;
    pub const CATEGORIES: EventCategory = EventCategory::SHADER_HOT_RELOAD;

    pub fn new(
        sender: SenderId,
        work_id: u64,
        program_name: impl Into<String>,
        bundle: Arc<dyn ShaderBundle>,
    ) -> ShaderCompilationCompletedMessage {
        ShaderCompilationCompletedMessage {
            sender,
            work_id,
            program_name: program_name.into(),
            bundle: Some(bundle),
            used_cache: false,
            warnings: Vec::new(),
            success: true,
            error: String::new(),
        }
    }
}

impl_event_message!(ShaderCompilationCompletedMessage);

impl super::WorkerResultMessage for ShaderCompilationCompletedMessage {
    fn from_failure(work_id: u64, sender: SenderId, error: String) -> Self {
        ShaderCompilationCompletedMessage {
            sender,
            work_id,
            program_name: String::new(),
            bundle: None,
            used_cache: false,
            warnings: Vec::new(),
            success: false,
            error,
        }
    }

    fn work_id(&self) -> u64 {
        self.work_id
    }
}

#[derive(Debug)]
pub struct ShaderCompilationFailedMessage {
    pub sender: SenderId,
    pub program_name: String,
    pub error_message: String,
    pub failed_stage: String,
    pub warnings: Vec<String>,
}

impl ShaderCompilationFailedMessage {
    pub const TYPE: MessageType = shader_types::COMPILATION_FAILED;
    pub const CATEGORIES: EventCategory = EventCategory::SHADER_HOT_RELOAD;
}

impl_event_message!(ShaderCompilationFailedMessage);

#[derive(Debug)]
pub struct ShaderHotReloadReadyMessage {
    pub sender: SenderId,
    pub shader_path: String,
}

impl ShaderHotReloadReadyMessage {
    pub const TYPE: MessageType = shader_types::HOT_RELOAD_READY;
    pub const CATEGORIES: EventCategory = EventCategory::SHADER_HOT_RELOAD;
}

impl_event_message!(ShaderHotReloadReadyMessage);
