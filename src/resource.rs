//! Typed resources and the graph-owned resource arena.
//!
//! A `Resource` is a tagged value tracked by the graph:
//! * the tag is fixed when the resource is created and never changes,
//! * every mutation bumps a monotonically increasing generation,
//! * `Transient` payloads are cleared at frame start and must be written
//!   before they are read,
//! * ownership is exclusive to the arena; nodes only ever hold `ResourceId`s.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use slotmap::{new_key_type, SlotMap};

use crate::error::{GraphError, GraphResult};

new_key_type! {
    /// Stable arena key for a tracked resource.
    pub struct ResourceId;
}

//--------------------------------------------------------------------------------------------------

/// Discriminant over the resource type registry.
///
/// The tag of a resource never changes after creation; typed accessors match
/// on it before touching the payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TypeTag {
    /// Opaque API object handle (pipeline, layout, module, ...).
    Handle,
    Image,
    Buffer,
    U32,
    U64,
    I64,
    F32,
    F64,
    Bool,
    Text,
    Blob,
    /// Shared pointer to an arbitrary structure (shader bundles, device wrappers).
    Dyn,
}

/// Whether a resource survives frame boundaries.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ResourceLifetime {
    /// Rebuilt each frame; cleared at frame start.
    Transient,
    /// Survives frames; recreated only on invalidation.
    #[default]
    Persistent,
}

//--------------------------------------------------------------------------------------------------
// Descriptors
//
// Descriptors carry the schema of a resource (format, usage, dimensions) so
// validation can run before the payload exists.

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageDescription {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Format name, empty means undefined (skipped by validation).
    pub format: String,
    pub usage: u32,
    pub mip_levels: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferDescription {
    pub size: u64,
    pub usage: u32,
    pub stride: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandleDescriptor {
    /// Name of the underlying API type, for diagnostics only.
    pub type_name: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum ResourceDescriptor {
    #[default]
    None,
    Handle(HandleDescriptor),
    Image(ImageDescription),
    Buffer(BufferDescription),
}

impl ResourceDescriptor {
    pub fn image(&self) -> Option<&ImageDescription> {
        match self {
            ResourceDescriptor::Image(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<&BufferDescription> {
        match self {
            ResourceDescriptor::Buffer(desc) => Some(desc),
            _ => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Values

/// Shared pointer payload for structured data that crosses the graph boundary
/// opaquely (shader bundles, device wrappers).
pub type DynPayload = Arc<dyn Any + Send + Sync>;

/// The payload of a resource. `Empty` means not yet populated this frame
/// (or never, for persistent resources that were not written).
#[derive(Clone)]
pub enum ResourceValue {
    Empty,
    Handle(u64),
    Image { desc: ImageDescription, handle: Option<u64> },
    Buffer { desc: BufferDescription, handle: Option<u64> },
    U32(u32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    Dyn(DynPayload),
}

impl ResourceValue {
    pub fn tag(&self) -> Option<TypeTag> {
        match self {
            ResourceValue::Empty => None,
            ResourceValue::Handle(_) => Some(TypeTag::Handle),
            ResourceValue::Image { .. } => Some(TypeTag::Image),
            ResourceValue::Buffer { .. } => Some(TypeTag::Buffer),
            ResourceValue::U32(_) => Some(TypeTag::U32),
            ResourceValue::U64(_) => Some(TypeTag::U64),
            ResourceValue::I64(_) => Some(TypeTag::I64),
            ResourceValue::F32(_) => Some(TypeTag::F32),
            ResourceValue::F64(_) => Some(TypeTag::F64),
            ResourceValue::Bool(_) => Some(TypeTag::Bool),
            ResourceValue::Text(_) => Some(TypeTag::Text),
            ResourceValue::Blob(_) => Some(TypeTag::Blob),
            ResourceValue::Dyn(_) => Some(TypeTag::Dyn),
        }
    }
}

impl std::fmt::Debug for ResourceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResourceValue::Empty => write!(f, "Empty"),
            ResourceValue::Handle(h) => write!(f, "Handle({h:#x})"),
            ResourceValue::Image { desc, handle } => {
                write!(f, "Image({}x{}, handle={handle:?})", desc.width, desc.height)
            }
            ResourceValue::Buffer { desc, handle } => {
                write!(f, "Buffer({} bytes, handle={handle:?})", desc.size)
            }
            ResourceValue::U32(v) => write!(f, "U32({v})"),
            ResourceValue::U64(v) => write!(f, "U64({v})"),
            ResourceValue::I64(v) => write!(f, "I64({v})"),
            ResourceValue::F32(v) => write!(f, "F32({v})"),
            ResourceValue::F64(v) => write!(f, "F64({v})"),
            ResourceValue::Bool(v) => write!(f, "Bool({v})"),
            ResourceValue::Text(v) => write!(f, "Text({v:?})"),
            ResourceValue::Blob(v) => write!(f, "Blob({} bytes)", v.len()),
            ResourceValue::Dyn(_) => write!(f, "Dyn(..)"),
        }
    }
}

/// Maps Rust types to resource tags for the typed accessors. The compile-time
/// slot declarations forbid mistyped `In`/`Out` at the call site; this trait
/// is the runtime half of that check.
pub trait ResourceData: Clone + Send + Sync + 'static {
    const TAG: TypeTag;
    fn into_value(self) -> ResourceValue;
    fn from_value(value: &ResourceValue) -> Option<Self>;
}

macro_rules! impl_resource_data {
    ($ty:ty, $tag:ident) => {
        impl ResourceData for $ty {
            const TAG: TypeTag = TypeTag::$tag;
            fn into_value(self) -> ResourceValue {
                ResourceValue::$tag(self)
            }
            fn from_value(value: &ResourceValue) -> Option<Self> {
                match value {
                    ResourceValue::$tag(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_resource_data!(u32, U32);
impl_resource_data!(u64, U64);
impl_resource_data!(i64, I64);
impl_resource_data!(f32, F32);
impl_resource_data!(f64, F64);
impl_resource_data!(bool, Bool);
impl_resource_data!(String, Text);
impl_resource_data!(Vec<u8>, Blob);

/// Newtype for opaque API handles so they do not collide with `u64` scalars.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct OpaqueHandle(pub u64);

impl ResourceData for OpaqueHandle {
    const TAG: TypeTag = TypeTag::Handle;
    fn into_value(self) -> ResourceValue {
        ResourceValue::Handle(self.0)
    }
    fn from_value(value: &ResourceValue) -> Option<Self> {
        match value {
            ResourceValue::Handle(h) => Some(OpaqueHandle(*h)),
            _ => None,
        }
    }
}

impl ResourceData for DynPayload {
    const TAG: TypeTag = TypeTag::Dyn;
    fn into_value(self) -> ResourceValue {
        ResourceValue::Dyn(self)
    }
    fn from_value(value: &ResourceValue) -> Option<Self> {
        match value {
            ResourceValue::Dyn(p) => Some(p.clone()),
            _ => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------

/// A tracked value owned by the graph's resource arena.
#[derive(Debug)]
pub struct Resource {
    name: String,
    tag: TypeTag,
    lifetime: ResourceLifetime,
    descriptor: ResourceDescriptor,
    value: ResourceValue,
    generation: u64,
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        tag: TypeTag,
        lifetime: ResourceLifetime,
        descriptor: ResourceDescriptor,
    ) -> Resource {
        Resource {
            name: name.into(),
            tag,
            lifetime,
            descriptor,
            value: ResourceValue::Empty,
            generation: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn lifetime(&self) -> ResourceLifetime {
        self.lifetime
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_written(&self) -> bool {
        !matches!(self.value, ResourceValue::Empty)
    }

    /// Typed read. Fails on tag mismatch or an unwritten payload.
    pub fn get<T: ResourceData>(&self) -> GraphResult<T> {
        if T::TAG != self.tag {
            return Err(GraphError::ResourceTypeMismatch {
                expected: T::TAG,
                actual: self.tag,
            });
        }
        match &self.value {
            ResourceValue::Empty => Err(GraphError::ResourceNotWritten),
            v => T::from_value(v).ok_or(GraphError::ResourceTypeMismatch {
                expected: T::TAG,
                actual: self.tag,
            }),
        }
    }

    /// Typed write. Fails if the value's tag differs from the declared tag.
    /// Every successful write bumps the generation.
    pub fn set<T: ResourceData>(&mut self, value: T) -> GraphResult<()> {
        if T::TAG != self.tag {
            return Err(GraphError::ResourceTypeMismatch {
                expected: self.tag,
                actual: T::TAG,
            });
        }
        self.value = value.into_value();
        self.generation += 1;
        Ok(())
    }

    /// Raw write used by nodes that produce image/buffer payloads; the tag
    /// check still applies.
    pub fn set_value(&mut self, value: ResourceValue) -> GraphResult<()> {
        match value.tag() {
            Some(tag) if tag == self.tag => {
                self.value = value;
                self.generation += 1;
                Ok(())
            }
            Some(tag) => Err(GraphError::ResourceTypeMismatch {
                expected: self.tag,
                actual: tag,
            }),
            None => Err(GraphError::ResourceNotWritten),
        }
    }

    pub fn value(&self) -> &ResourceValue {
        &self.value
    }

    /// Typed read of a `Dyn` payload.
    pub fn get_dyn<T: Any + Send + Sync>(&self) -> GraphResult<Arc<T>> {
        let payload: DynPayload = self.get()?;
        payload
            .downcast::<T>()
            .map_err(|_| GraphError::ResourceTypeMismatch {
                expected: TypeTag::Dyn,
                actual: self.tag,
            })
    }

    /// Frame-start reset. Transient payloads are dropped so a read before the
    /// producing task has run reports `ResourceNotWritten`.
    pub fn begin_frame(&mut self) {
        if self.lifetime == ResourceLifetime::Transient && self.is_written() {
            self.value = ResourceValue::Empty;
        }
    }

    /// Invalidation reset for persistent resources (window resize and the like).
    pub fn invalidate(&mut self) {
        self.value = ResourceValue::Empty;
        self.generation += 1;
    }
}

//--------------------------------------------------------------------------------------------------

/// The graph's resource arena. Exclusive owner of every `Resource`; hands out
/// ids with stable identity for the arena's lifetime.
///
/// Each slot carries its own lock so that tasks scheduled by the executor can
/// touch disjoint resources concurrently. The dependency graph guarantees
/// conflicting accesses never overlap; the lock enforces it.
#[derive(Default)]
pub struct ResourceArena {
    slots: SlotMap<ResourceId, RwLock<Resource>>,
}

impl ResourceArena {
    pub fn new() -> ResourceArena {
        ResourceArena::default()
    }

    pub fn insert(&mut self, resource: Resource) -> ResourceId {
        self.slots.insert(RwLock::new(resource))
    }

    pub fn remove(&mut self, id: ResourceId) -> Option<Resource> {
        self.slots.remove(id).map(|lock| lock.into_inner())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn with_read<R>(&self, id: ResourceId, f: impl FnOnce(&Resource) -> R) -> GraphResult<R> {
        let slot = self.slots.get(id).ok_or(GraphError::UnknownResource)?;
        Ok(f(&slot.read()))
    }

    pub fn with_write<R>(
        &self,
        id: ResourceId,
        f: impl FnOnce(&mut Resource) -> R,
    ) -> GraphResult<R> {
        let slot = self.slots.get(id).ok_or(GraphError::UnknownResource)?;
        Ok(f(&mut slot.write()))
    }

    pub fn ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.slots.keys()
    }

    /// Frame-start pass over every resource (transient clearing).
    pub fn begin_frame(&self) {
        for (_, slot) in self.slots.iter() {
            slot.write().begin_frame();
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

//--------------------------------------------------------------------------------------------------
