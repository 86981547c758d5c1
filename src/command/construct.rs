//! Object construction commands.
//!
//! Construction is asymmetric: workers build the real object for every
//! kind, while the coordinator builds a functional mirror only for the
//! kinds it needs locally and an identity-only entry for the rest. The
//! identity entries still carry the kind, so coordinator-side kind checks
//! work without any object state.

use crate::command::context::CommandCtx;
use crate::command::registry::{CommandRegistry, COMMAND_CATALOG};
use crate::command::{tags, Command};
use crate::core::errors::{BeamlineError, ProtocolError, Result};
use crate::handle::Handle;
use crate::object::{DataArray, DataFormat, ObjectKind, SceneObject};
use crate::wire::{ReadStream, WriteStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// Build the real object for a kind/type pair on this process
fn construct_for(ctx: &CommandCtx, kind: ObjectKind, type_name: &str) -> Result<SceneObject> {
    if kind.built_directly() {
        return Ok(match kind {
            ObjectKind::World => SceneObject::world(),
            _ => SceneObject::group(),
        });
    }
    match ctx.catalog().construct(kind, type_name) {
        Some(detail) => Ok(SceneObject::with_detail(kind, type_name, detail)),
        None => Err(BeamlineError::UnknownObjectType {
            kind: kind.label(),
            name: type_name.to_owned(),
        }),
    }
}

/// Create one object of an enumerated kind under a pre-assigned handle
#[derive(Debug)]
pub struct NewObject {
    pub kind: ObjectKind,
    pub type_name: String,
    pub handle: Handle,
}

impl NewObject {
    pub fn new(kind: ObjectKind, type_name: impl Into<String>, handle: Handle) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            handle,
        }
    }
}

impl Default for NewObject {
    fn default() -> Self {
        Self::new(ObjectKind::Renderer, "", Handle::NULL)
    }
}

#[async_trait]
impl Command for NewObject {
    fn tag(&self) -> u64 {
        tags::NEW_OBJECT
    }

    fn name(&self) -> &'static str {
        "new_object"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_u32(self.kind.to_u32());
        w.write_str(&self.type_name)?;
        w.write_handle(self.handle);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        let raw = r.read_u32()?;
        self.kind = ObjectKind::from_u32(raw)
            .ok_or_else(|| ProtocolError::malformed("kind", format!("unknown object kind {raw}")))?;
        self.type_name = r.read_str("type_name")?;
        self.handle = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = construct_for(ctx, self.kind, &self.type_name)?;
        ctx.handles().bind(self.handle, Arc::new(object))?;
        trace!(kind = self.kind.label(), type_name = %self.type_name, handle = %self.handle, "object created");
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = if self.kind.mirror_constructed() {
            construct_for(ctx, self.kind, &self.type_name)?
        } else {
            SceneObject::new(self.kind, self.type_name.clone())
        };
        ctx.handles().bind(self.handle, Arc::new(object))?;
        Ok(())
    }
}

/// Create a material for a renderer type
#[derive(Debug, Default)]
pub struct NewMaterial {
    pub renderer_type: String,
    pub material_type: String,
    pub handle: Handle,
}

impl NewMaterial {
    pub fn new(
        renderer_type: impl Into<String>,
        material_type: impl Into<String>,
        handle: Handle,
    ) -> Self {
        Self {
            renderer_type: renderer_type.into(),
            material_type: material_type.into(),
            handle,
        }
    }
}

#[async_trait]
impl Command for NewMaterial {
    fn tag(&self) -> u64 {
        tags::NEW_MATERIAL
    }

    fn name(&self) -> &'static str {
        "new_material"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_str(&self.renderer_type)?;
        w.write_str(&self.material_type)?;
        w.write_handle(self.handle);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.renderer_type = r.read_str("renderer_type")?;
        self.material_type = r.read_str("material_type")?;
        self.handle = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let detail = ctx
            .catalog()
            .construct_material(&self.renderer_type, &self.material_type)
            .ok_or_else(|| BeamlineError::UnknownObjectType {
                kind: "material",
                name: format!("{}/{}", self.renderer_type, self.material_type),
            })?;
        let object = SceneObject::with_detail(ObjectKind::Material, &self.material_type, detail);
        ctx.handles().bind(self.handle, Arc::new(object))?;
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = SceneObject::new(ObjectKind::Material, self.material_type.clone());
        ctx.handles().bind(self.handle, Arc::new(object))?;
        Ok(())
    }
}

/// Create an instance wrapping a group
#[derive(Debug, Default)]
pub struct NewInstance {
    pub handle: Handle,
    pub group: Handle,
}

#[async_trait]
impl Command for NewInstance {
    fn tag(&self) -> u64 {
        tags::NEW_INSTANCE
    }

    fn name(&self) -> &'static str {
        "new_instance"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.handle);
        w.write_handle(self.group);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.handle = r.read_handle()?;
        self.group = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let group = ctx.resolve_kind(self.group, ObjectKind::Group)?;
        ctx.handles()
            .bind(self.handle, Arc::new(SceneObject::instance(group)))?;
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        ctx.resolve_kind(self.group, ObjectKind::Group)?;
        let object = SceneObject::new(ObjectKind::Instance, "instance");
        ctx.handles().bind(self.handle, Arc::new(object))?;
        Ok(())
    }
}

/// Create a geometric model wrapping a geometry
#[derive(Debug, Default)]
pub struct NewGeometricModel {
    pub handle: Handle,
    pub geometry: Handle,
}

#[async_trait]
impl Command for NewGeometricModel {
    fn tag(&self) -> u64 {
        tags::NEW_GEOMETRIC_MODEL
    }

    fn name(&self) -> &'static str {
        "new_geometric_model"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.handle);
        w.write_handle(self.geometry);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.handle = r.read_handle()?;
        self.geometry = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let geometry = ctx.resolve_kind(self.geometry, ObjectKind::Geometry)?;
        ctx.handles()
            .bind(self.handle, Arc::new(SceneObject::geometric_model(geometry)))?;
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        ctx.resolve_kind(self.geometry, ObjectKind::Geometry)?;
        let object = SceneObject::new(ObjectKind::GeometricModel, "geometricModel");
        ctx.handles().bind(self.handle, Arc::new(object))?;
        Ok(())
    }
}

/// Create a volumetric model wrapping a volume
#[derive(Debug, Default)]
pub struct NewVolumetricModel {
    pub handle: Handle,
    pub volume: Handle,
}

#[async_trait]
impl Command for NewVolumetricModel {
    fn tag(&self) -> u64 {
        tags::NEW_VOLUMETRIC_MODEL
    }

    fn name(&self) -> &'static str {
        "new_volumetric_model"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.handle);
        w.write_handle(self.volume);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.handle = r.read_handle()?;
        self.volume = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let volume = ctx.resolve_kind(self.volume, ObjectKind::Volume)?;
        ctx.handles()
            .bind(self.handle, Arc::new(SceneObject::volumetric_model(volume)))?;
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        ctx.resolve_kind(self.volume, ObjectKind::Volume)?;
        let object = SceneObject::new(ObjectKind::VolumetricModel, "volumetricModel");
        ctx.handles().bind(self.handle, Arc::new(object))?;
        Ok(())
    }
}

/// Create a typed data array from an inline payload.
///
/// Numeric payloads are kept verbatim. Object payloads carry handles that
/// each process resolves against its own table, so the array ends up
/// holding references to the locally equivalent objects.
#[derive(Debug)]
pub struct NewData {
    pub handle: Handle,
    pub format: DataFormat,
    pub count: u64,
    pub shared: bool,
    pub payload: Bytes,
}

impl Default for NewData {
    fn default() -> Self {
        Self {
            handle: Handle::NULL,
            format: DataFormat::U8,
            count: 0,
            shared: false,
            payload: Bytes::new(),
        }
    }
}

impl NewData {
    fn build_array(&self, ctx: &CommandCtx) -> Result<DataArray> {
        if self.format == DataFormat::Object {
            let mut r = ReadStream::new(self.payload.clone());
            let mut refs = Vec::with_capacity(self.count as usize);
            for _ in 0..self.count {
                let handle = r.read_handle()?;
                refs.push(ctx.handles().lookup(handle)?);
            }
            Ok(DataArray::from_objects(refs, self.shared))
        } else {
            Ok(DataArray::numeric(
                self.format,
                self.count,
                self.payload.clone(),
                self.shared,
            )?)
        }
    }
}

#[async_trait]
impl Command for NewData {
    fn tag(&self) -> u64 {
        tags::NEW_DATA
    }

    fn name(&self) -> &'static str {
        "new_data"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.handle);
        w.write_u32(self.format.to_u32());
        w.write_u64(self.count);
        w.write_bool(self.shared);
        w.write_bytes(&self.payload);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.handle = r.read_handle()?;
        let raw = r.read_u32()?;
        self.format = DataFormat::from_u32(raw)
            .ok_or_else(|| ProtocolError::malformed("format", format!("unknown data format {raw}")))?;
        self.count = r.read_u64()?;
        self.shared = r.read_bool()?;
        self.payload = r.read_bytes("payload")?;

        let expected = self.count as usize * self.format.stride();
        if self.payload.len() != expected {
            return Err(ProtocolError::malformed(
                "payload",
                format!(
                    "{} x {} elements need {expected} bytes, payload has {}",
                    self.count,
                    self.format.label(),
                    self.payload.len()
                ),
            ));
        }
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let array = self.build_array(ctx)?;
        ctx.handles()
            .bind(self.handle, Arc::new(SceneObject::data(array)))?;
        Ok(())
    }

    // data arrays mirror on the coordinator unconditionally: object arrays
    // must resolve against the mirror table to keep its lifetimes aligned
    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        self.run(ctx).await
    }
}

#[linkme::distributed_slice(COMMAND_CATALOG)]
static REGISTER_CONSTRUCT: fn(&mut CommandRegistry) = register;

fn register(registry: &mut CommandRegistry) {
    registry.register(tags::NEW_OBJECT, || Box::new(NewObject::default()));
    registry.register(tags::NEW_MATERIAL, || Box::new(NewMaterial::default()));
    registry.register(tags::NEW_INSTANCE, || Box::new(NewInstance::default()));
    registry.register(tags::NEW_GEOMETRIC_MODEL, || {
        Box::new(NewGeometricModel::default())
    });
    registry.register(tags::NEW_VOLUMETRIC_MODEL, || {
        Box::new(NewVolumetricModel::default())
    });
    registry.register(tags::NEW_DATA, || Box::new(NewData::default()));
}
