//! Scene object model shared by every process in the cluster.
//!
//! Objects are plain state holders addressed through the handle table; all
//! behavior lives in the commands that operate on them. Which side holds
//! real state for a given kind is a protocol decision: workers construct
//! everything, the coordinator constructs only the kinds it mirrors and
//! tracks the rest as remote identities.

pub mod catalog;
pub mod framebuffer;
pub mod future;
pub mod kind;
pub mod params;

pub use self::catalog::{load_code, ModuleRegistry, TypeCatalog, OBJECT_TYPES};
pub use self::framebuffer::{channel, ColorFormat, FrameBufferState};
pub use self::future::RenderFuture;
pub use self::kind::ObjectKind;
pub use self::params::{ParamSlot, ParamStore, ParamValue};

use crate::core::errors::ProtocolError;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shading model selected by renderer type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererFlavor {
    SciVis,
    PathTracer,
    Debug,
}

impl RendererFlavor {
    pub fn label(self) -> &'static str {
        match self {
            Self::SciVis => "scivis",
            Self::PathTracer => "pathtracer",
            Self::Debug => "debug",
        }
    }
}

/// Projection selected by camera type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraModel {
    Perspective,
    Orthographic,
    Panoramic,
}

impl CameraModel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Perspective => "perspective",
            Self::Orthographic => "orthographic",
            Self::Panoramic => "panoramic",
        }
    }
}

/// Element layout of a data array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataFormat {
    U8 = 1,
    U32 = 2,
    U64 = 3,
    I32 = 4,
    F32 = 5,
    Vec2f = 6,
    Vec3f = 7,
    Vec4f = 8,
    Vec2i = 9,
    Vec3i = 10,
    /// Elements are object handles, resolved to references on receipt
    Object = 11,
}

impl DataFormat {
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::U8),
            2 => Some(Self::U32),
            3 => Some(Self::U64),
            4 => Some(Self::I32),
            5 => Some(Self::F32),
            6 => Some(Self::Vec2f),
            7 => Some(Self::Vec3f),
            8 => Some(Self::Vec4f),
            9 => Some(Self::Vec2i),
            10 => Some(Self::Vec3i),
            11 => Some(Self::Object),
            _ => None,
        }
    }

    /// Bytes per element on the wire
    pub const fn stride(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 => 8,
            Self::Vec2f | Self::Vec2i => 8,
            Self::Vec3f | Self::Vec3i => 12,
            Self::Vec4f => 16,
            Self::Object => 8,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::Vec2f => "vec2f",
            Self::Vec3f => "vec3f",
            Self::Vec4f => "vec4f",
            Self::Vec2i => "vec2i",
            Self::Vec3i => "vec3i",
            Self::Object => "object",
        }
    }
}

/// Typed element array. Numeric arrays keep the wire payload as-is;
/// object arrays hold references resolved through the handle table, which
/// keeps the referenced objects alive for as long as the array lives.
pub struct DataArray {
    format: DataFormat,
    count: u64,
    bytes: Bytes,
    object_refs: Vec<Arc<SceneObject>>,
    shared: bool,
}

impl DataArray {
    /// Build a numeric array, checking that the payload matches the
    /// declared element count and stride.
    pub fn numeric(
        format: DataFormat,
        count: u64,
        bytes: Bytes,
        shared: bool,
    ) -> Result<Self, ProtocolError> {
        let expected = count as usize * format.stride();
        if bytes.len() != expected {
            return Err(ProtocolError::malformed(
                "data",
                format!(
                    "{count} x {} elements need {expected} bytes, payload has {}",
                    format.label(),
                    bytes.len()
                ),
            ));
        }
        Ok(Self {
            format,
            count,
            bytes,
            object_refs: Vec::new(),
            shared,
        })
    }

    /// Build an object-reference array from already-resolved references
    pub fn from_objects(object_refs: Vec<Arc<SceneObject>>, shared: bool) -> Self {
        Self {
            format: DataFormat::Object,
            count: object_refs.len() as u64,
            bytes: Bytes::new(),
            object_refs,
            shared,
        }
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Ownership flag from creation: shared arrays alias application memory
    /// on the originating process and are copied everywhere else.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn objects(&self) -> &[Arc<SceneObject>] {
        &self.object_refs
    }
}

/// Commit-time snapshot of a world or group's member objects.
///
/// Members arrive as parameters (single references or object arrays), so the
/// flattened view is rebuilt from the committed parameter map on each commit
/// rather than tracked incrementally.
#[derive(Default)]
pub struct SceneRoster {
    members: RwLock<Vec<Arc<SceneObject>>>,
}

impl SceneRoster {
    pub fn refresh(&self, params: &ParamStore) {
        let mut flattened = Vec::new();
        for (_, object) in params.committed_objects() {
            if let Detail::Data(array) = object.detail() {
                flattened.extend(array.objects().iter().cloned());
            } else {
                flattened.push(object);
            }
        }
        *self.members.write() = flattened;
    }

    pub fn members(&self) -> Vec<Arc<SceneObject>> {
        self.members.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }
}

/// Kind-specific object state
pub enum Detail {
    /// Identity-only view of an object whose state lives on other processes
    Remote,
    Renderer(RendererFlavor),
    Camera(CameraModel),
    Volume { topology: &'static str },
    Geometry { shape: &'static str },
    Light { variant: &'static str },
    Texture { variant: &'static str },
    TransferFunction,
    World(SceneRoster),
    Group(SceneRoster),
    ImageOperation { effect: &'static str },
    Material { renderer_type: String },
    Instance { group: Arc<SceneObject> },
    GeometricModel { geometry: Arc<SceneObject> },
    VolumetricModel { volume: Arc<SceneObject> },
    Data(DataArray),
    FrameBuffer(FrameBufferState),
    Future(RenderFuture),
}

/// One scene object: enumerated kind, type name, parameters, and whatever
/// kind-specific state this process holds for it.
pub struct SceneObject {
    kind: ObjectKind,
    type_name: String,
    params: ParamStore,
    detail: Detail,
    committed: AtomicBool,
}

impl SceneObject {
    /// Identity-only object for kinds this process does not construct
    pub fn new(kind: ObjectKind, type_name: impl Into<String>) -> Self {
        Self::with_detail(kind, type_name, Detail::Remote)
    }

    /// Catalog-constructed object carrying concrete state
    pub fn with_detail(kind: ObjectKind, type_name: impl Into<String>, detail: Detail) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            params: ParamStore::new(),
            detail,
            committed: AtomicBool::new(false),
        }
    }

    pub fn world() -> Self {
        Self::with_detail(ObjectKind::World, "world", Detail::World(SceneRoster::default()))
    }

    pub fn group() -> Self {
        Self::with_detail(ObjectKind::Group, "group", Detail::Group(SceneRoster::default()))
    }

    pub fn instance(group: Arc<SceneObject>) -> Self {
        Self::with_detail(ObjectKind::Instance, "instance", Detail::Instance { group })
    }

    pub fn geometric_model(geometry: Arc<SceneObject>) -> Self {
        Self::with_detail(
            ObjectKind::GeometricModel,
            "geometricModel",
            Detail::GeometricModel { geometry },
        )
    }

    pub fn volumetric_model(volume: Arc<SceneObject>) -> Self {
        Self::with_detail(
            ObjectKind::VolumetricModel,
            "volumetricModel",
            Detail::VolumetricModel { volume },
        )
    }

    pub fn data(array: DataArray) -> Self {
        Self::with_detail(ObjectKind::Data, "data", Detail::Data(array))
    }

    pub fn framebuffer(state: FrameBufferState) -> Self {
        Self::with_detail(ObjectKind::FrameBuffer, "framebuffer", Detail::FrameBuffer(state))
    }

    pub fn future(future: RenderFuture) -> Self {
        Self::with_detail(ObjectKind::Future, "future", Detail::Future(future))
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn detail(&self) -> &Detail {
        &self.detail
    }

    /// Snapshot staged parameters and refresh any derived scene state
    pub fn commit(&self) {
        self.params.commit();
        match &self.detail {
            Detail::World(roster) | Detail::Group(roster) => roster.refresh(&self.params),
            _ => {}
        }
        self.committed.store(true, Ordering::Release);
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub fn as_framebuffer(&self) -> Option<&FrameBufferState> {
        match &self.detail {
            Detail::FrameBuffer(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_future(&self) -> Option<&RenderFuture> {
        match &self.detail {
            Detail::Future(future) => Some(future),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataArray> {
        match &self.detail {
            Detail::Data(array) => Some(array),
            _ => None,
        }
    }

    pub fn roster(&self) -> Option<&SceneRoster> {
        match &self.detail {
            Detail::World(roster) | Detail::Group(roster) => Some(roster),
            _ => None,
        }
    }

    pub fn renderer_flavor(&self) -> Option<RendererFlavor> {
        match &self.detail {
            Detail::Renderer(flavor) => Some(*flavor),
            _ => None,
        }
    }

    pub fn camera_model(&self) -> Option<CameraModel> {
        match &self.detail {
            Detail::Camera(model) => Some(*model),
            _ => None,
        }
    }

    /// Inner reference for the wrapper kinds (instance and the two models)
    pub fn wrapped(&self) -> Option<&Arc<SceneObject>> {
        match &self.detail {
            Detail::Instance { group } => Some(group),
            Detail::GeometricModel { geometry } => Some(geometry),
            Detail::VolumetricModel { volume } => Some(volume),
            _ => None,
        }
    }
}

impl fmt::Debug for SceneObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneObject")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Count of render tasks currently touching scene state on this process.
///
/// Commands that mutate state wait for the count to reach zero before
/// running, which is what turns "rendering and mutating concurrently is
/// undefined" into a hard ordering guarantee.
#[derive(Default)]
pub struct TaskGuards {
    active: AtomicUsize,
    idle: Notify,
}

impl TaskGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one in-flight task; the claim releases itself on drop
    pub fn claim(self: &Arc<Self>) -> TaskClaim {
        self.active.fetch_add(1, Ordering::AcqRel);
        TaskClaim {
            guards: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Resolve once no task holds a claim. The waiter registers before
    /// re-checking the counter so a release landing in between is not lost.
    pub async fn wait_idle(&self) {
        loop {
            let mut pending = std::pin::pin!(self.idle.notified());
            pending.as_mut().enable();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            pending.await;
        }
    }
}

/// RAII claim held by a render task for its full lifetime
pub struct TaskClaim {
    guards: Arc<TaskGuards>,
}

impl Drop for TaskClaim {
    fn drop(&mut self) {
        if self.guards.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.guards.idle.notify_waiters();
        }
    }
}
