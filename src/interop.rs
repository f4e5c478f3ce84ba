//! External collaborator interfaces.
//!
//! The core performs no GPU work itself. Presentation, shader compilation,
//! device object caching and GPU timing live behind these traits; the
//! runtime only holds shared handles and never frees them directly.

use std::any::Any;
use std::sync::Arc;

use crate::error::GraphResult;

//--------------------------------------------------------------------------------------------------
// Presentation

/// Outcome of an acquire/present call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PresentStatus {
    Success,
    /// Usable but no longer optimal for the surface.
    Suboptimal,
    /// Unusable; the swapchain must be recreated.
    OutOfDate,
}

/// Acquire-image / submit / present cycle.
///
/// Contract: on `Suboptimal` or `OutOfDate` the collaborator publishes a
/// `WindowResizedMessage` so the graph can recompile the affected subtree.
pub trait PresentationTarget: Send + Sync {
    fn acquire_image(&self) -> GraphResult<PresentStatus>;
    fn present(&self) -> GraphResult<PresentStatus>;
    fn surface_extent(&self) -> (u32, u32);
}

//--------------------------------------------------------------------------------------------------
// Shader bundles

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    TessControl,
    TessEval,
    Compute,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    CombinedImageSampler,
}

/// One reflected descriptor binding.
#[derive(Clone, Debug)]
pub struct DescriptorBinding {
    pub set: u32,
    pub binding: u32,
    pub name: String,
    pub kind: DescriptorKind,
    pub array_size: u32,
}

/// One reflected push-constant range.
#[derive(Copy, Clone, Debug)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
}

/// Opaque compiled shader program. Produced outside the core and consumed by
/// pipeline nodes through reflection data only.
pub trait ShaderBundle: Send + Sync {
    /// Backend handle of the module for a stage, if the stage is present.
    fn stage_module(&self, stage: ShaderStage) -> Option<u64>;
    fn descriptor_bindings(&self) -> &[DescriptorBinding];
    fn push_constant_ranges(&self) -> &[PushConstantRange];
    /// Reflected compute workgroup size; `[0, 0, 0]` for graphics programs.
    fn workgroup_size(&self) -> [u32; 3];
}

//--------------------------------------------------------------------------------------------------
// Device cache

/// Get-or-create cache for pipeline/layout/module wrappers, keyed by content
/// hash. The core caches the returned handles and never frees them.
pub trait DeviceCache: Send + Sync {
    fn get_or_create(
        &self,
        content_hash: u64,
        create: &dyn Fn() -> Arc<dyn Any + Send + Sync>,
    ) -> Arc<dyn Any + Send + Sync>;
    fn contains(&self, content_hash: u64) -> bool;
}

//--------------------------------------------------------------------------------------------------
// GPU timing

/// Token for an in-flight GPU timestamp query.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct QuerySlot(pub u32);

/// Vends timestamp query slots for performance profiling. Resolved values
/// flow back into task profiles through `Sampler::finalize`.
pub trait QueryProvider: Send + Sync {
    fn begin_query(&self) -> Option<QuerySlot>;
    /// Elapsed nanoseconds for a completed query, `None` while in flight.
    fn resolve(&self, slot: QuerySlot) -> Option<u64>;
}
