//! Parameter mutation and commit commands.
//!
//! Workers apply these to the real objects and fail hard on an undefined
//! target. The coordinator applies them only to objects whose kind it
//! mirrors; everything else degrades to a silent no-op there, the same
//! way optional state does.

use crate::command::context::CommandCtx;
use crate::command::registry::{CommandRegistry, COMMAND_CATALOG};
use crate::command::{tags, Command};
use crate::core::errors::{ProtocolError, Result};
use crate::handle::Handle;
use crate::object::{ParamSlot, ParamValue, SceneObject};
use crate::wire::{ReadStream, WriteStream};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolve a handle on the coordinator if its kind is in the mirrored set
fn mirrored(ctx: &CommandCtx, handle: Handle) -> Option<Arc<SceneObject>> {
    let object = ctx.handles().lookup(handle).ok()?;
    object.kind().mirrored_on_coordinator().then_some(object)
}

/// Stage a typed value parameter on an object
#[derive(Debug)]
pub struct SetParam {
    pub object: Handle,
    pub name: String,
    pub value: ParamValue,
}

impl SetParam {
    pub fn new(object: Handle, name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            object,
            name: name.into(),
            value,
        }
    }
}

impl Default for SetParam {
    fn default() -> Self {
        Self::new(Handle::NULL, "", ParamValue::Int(0))
    }
}

#[async_trait]
impl Command for SetParam {
    fn tag(&self) -> u64 {
        tags::SET_PARAM
    }

    fn name(&self) -> &'static str {
        "set_param"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.object);
        w.write_str(&self.name)?;
        self.value.write(w);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.object = r.read_handle()?;
        self.name = r.read_str("name")?;
        self.value = ParamValue::read(r)?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = ctx.handles().lookup(self.object)?;
        object
            .params()
            .set(&self.name, ParamSlot::Value(self.value.clone()));
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        if let Some(object) = mirrored(ctx, self.object) {
            object
                .params()
                .set(&self.name, ParamSlot::Value(self.value.clone()));
        }
        Ok(())
    }
}

/// Stage a string parameter on an object
#[derive(Debug, Default)]
pub struct SetParamString {
    pub object: Handle,
    pub name: String,
    pub text: String,
}

impl SetParamString {
    pub fn new(object: Handle, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            object,
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl Command for SetParamString {
    fn tag(&self) -> u64 {
        tags::SET_PARAM_STRING
    }

    fn name(&self) -> &'static str {
        "set_param_string"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.object);
        w.write_str(&self.name)?;
        w.write_str(&self.text)?;
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.object = r.read_handle()?;
        self.name = r.read_str("name")?;
        self.text = r.read_str("text")?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = ctx.handles().lookup(self.object)?;
        object
            .params()
            .set(&self.name, ParamSlot::Text(self.text.clone()));
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        if let Some(object) = mirrored(ctx, self.object) {
            object
                .params()
                .set(&self.name, ParamSlot::Text(self.text.clone()));
        }
        Ok(())
    }
}

/// Stage an object-reference parameter. A null target clears the
/// parameter instead of setting a null reference.
#[derive(Debug, Default)]
pub struct SetParamObject {
    pub object: Handle,
    pub name: String,
    pub target: Handle,
}

impl SetParamObject {
    pub fn new(object: Handle, name: impl Into<String>, target: Handle) -> Self {
        Self {
            object,
            name: name.into(),
            target,
        }
    }
}

#[async_trait]
impl Command for SetParamObject {
    fn tag(&self) -> u64 {
        tags::SET_PARAM_OBJECT
    }

    fn name(&self) -> &'static str {
        "set_param_object"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.object);
        w.write_str(&self.name)?;
        w.write_handle(self.target);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.object = r.read_handle()?;
        self.name = r.read_str("name")?;
        self.target = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = ctx.handles().lookup(self.object)?;
        if self.target.is_null() {
            object.params().remove(&self.name);
            return Ok(());
        }
        let target = ctx.handles().lookup(self.target)?;
        object.params().set(&self.name, ParamSlot::Object(target));
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let Some(object) = mirrored(ctx, self.object) else {
            return Ok(());
        };
        if self.target.is_null() {
            object.params().remove(&self.name);
            return Ok(());
        }
        if let Ok(target) = ctx.handles().lookup(self.target) {
            object.params().set(&self.name, ParamSlot::Object(target));
        }
        Ok(())
    }
}

/// Clear a staged parameter. Parameters are optional, so an undefined
/// handle or an unknown name is a no-op on every process.
#[derive(Debug, Default)]
pub struct RemoveParam {
    pub object: Handle,
    pub name: String,
}

impl RemoveParam {
    pub fn new(object: Handle, name: impl Into<String>) -> Self {
        Self {
            object,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Command for RemoveParam {
    fn tag(&self) -> u64 {
        tags::REMOVE_PARAM
    }

    fn name(&self) -> &'static str {
        "remove_param"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.object);
        w.write_str(&self.name)?;
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.object = r.read_handle()?;
        self.name = r.read_str("name")?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        match ctx.handles().lookup(self.object) {
            Ok(object) => object.params().remove(&self.name),
            Err(_) => {
                debug!(handle = %self.object, name = %self.name, "remove on undefined handle ignored")
            }
        }
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        if let Some(object) = mirrored(ctx, self.object) {
            object.params().remove(&self.name);
        }
        Ok(())
    }
}

/// Publish staged parameters as the object's committed state.
///
/// Render tasks read committed state only, so the staged-to-committed
/// swap must not overlap an in-flight render. The dispatch loop parks
/// here until outstanding render claims drain.
#[derive(Debug, Default)]
pub struct CommitObject {
    pub object: Handle,
}

impl CommitObject {
    pub fn new(object: Handle) -> Self {
        Self { object }
    }
}

#[async_trait]
impl Command for CommitObject {
    fn tag(&self) -> u64 {
        tags::COMMIT_OBJECT
    }

    fn name(&self) -> &'static str {
        "commit_object"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.object);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.object = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = ctx.handles().lookup(self.object)?;
        ctx.tasks().wait_idle().await;
        object.commit();
        trace!(handle = %self.object, kind = object.kind().label(), "committed");
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        if let Some(object) = mirrored(ctx, self.object) {
            ctx.tasks().wait_idle().await;
            object.commit();
        }
        Ok(())
    }
}

#[linkme::distributed_slice(COMMAND_CATALOG)]
static REGISTER_MUTATE: fn(&mut CommandRegistry) = register;

fn register(registry: &mut CommandRegistry) {
    registry.register(tags::SET_PARAM, || Box::new(SetParam::default()));
    registry.register(tags::SET_PARAM_STRING, || {
        Box::new(SetParamString::default())
    });
    registry.register(tags::SET_PARAM_OBJECT, || {
        Box::new(SetParamObject::default())
    });
    registry.register(tags::REMOVE_PARAM, || Box::new(RemoveParam::default()));
    registry.register(tags::COMMIT_OBJECT, || Box::new(CommitObject::default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::construct::NewObject;
    use crate::command::encode_command;
    use crate::core::config::ClusterConfig;
    use crate::core::errors::BeamlineError;
    use crate::object::ObjectKind;
    use crate::render::NullReplySink;
    use std::time::Duration;

    fn worker_ctx() -> Arc<CommandCtx> {
        Arc::new(CommandCtx::worker(
            0,
            1,
            &ClusterConfig::default(),
            Arc::new(NullReplySink),
        ))
    }

    fn coordinator_ctx() -> Arc<CommandCtx> {
        Arc::new(CommandCtx::coordinator(
            1,
            &ClusterConfig::default(),
            Arc::new(NullReplySink),
        ))
    }

    async fn renderer_on(ctx: &Arc<CommandCtx>, coordinator: bool) -> Handle {
        let handle = ctx.handles().allocate();
        let cmd = NewObject::new(ObjectKind::Renderer, "scivis", handle);
        if coordinator {
            cmd.run_on_coordinator(ctx).await.unwrap();
        } else {
            cmd.run(ctx).await.unwrap();
        }
        handle
    }

    #[tokio::test]
    async fn params_stay_staged_until_commit() {
        let ctx = worker_ctx();
        let renderer = renderer_on(&ctx, false).await;

        SetParamString::new(renderer, "aoSamples", "4")
            .run(&ctx)
            .await
            .unwrap();
        let object = ctx.handles().lookup(renderer).unwrap();
        assert!(object.params().committed("aoSamples").is_none());

        CommitObject::new(renderer).run(&ctx).await.unwrap();
        let object = ctx.handles().lookup(renderer).unwrap();
        assert_eq!(
            object
                .params()
                .committed("aoSamples")
                .and_then(|slot| slot.as_text().map(str::to_owned)),
            Some("4".to_owned())
        );
        assert!(object.is_committed());
    }

    #[tokio::test]
    async fn set_param_fails_hard_on_undefined_worker_handle() {
        let ctx = worker_ctx();
        let err = SetParam::new(Handle::from_raw(404), "x", ParamValue::Int(1))
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, BeamlineError::Handle { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn coordinator_applies_params_to_mirrored_kinds_only() {
        let ctx = coordinator_ctx();
        let renderer = renderer_on(&ctx, true).await;
        let world = ctx.handles().allocate();
        NewObject::new(ObjectKind::World, "world", world)
            .run_on_coordinator(&ctx)
            .await
            .unwrap();

        SetParam::new(renderer, "pixelSamples", ParamValue::Int(8))
            .run_on_coordinator(&ctx)
            .await
            .unwrap();
        SetParam::new(world, "pixelSamples", ParamValue::Int(8))
            .run_on_coordinator(&ctx)
            .await
            .unwrap();
        // undefined handles degrade the same way on the coordinator
        SetParam::new(Handle::from_raw(404), "pixelSamples", ParamValue::Int(8))
            .run_on_coordinator(&ctx)
            .await
            .unwrap();

        assert_eq!(
            ctx.handles().lookup(renderer).unwrap().params().staged_len(),
            1
        );
        assert_eq!(ctx.handles().lookup(world).unwrap().params().staged_len(), 0);
    }

    #[tokio::test]
    async fn null_object_target_clears_the_parameter() {
        let ctx = worker_ctx();
        let renderer = renderer_on(&ctx, false).await;
        let camera = ctx.handles().allocate();
        NewObject::new(ObjectKind::Camera, "perspective", camera)
            .run(&ctx)
            .await
            .unwrap();

        SetParamObject::new(renderer, "camera", camera)
            .run(&ctx)
            .await
            .unwrap();
        let object = ctx.handles().lookup(renderer).unwrap();
        assert!(object.params().staged("camera").is_some());

        SetParamObject::new(renderer, "camera", Handle::NULL)
            .run(&ctx)
            .await
            .unwrap();
        let object = ctx.handles().lookup(renderer).unwrap();
        assert!(object.params().staged("camera").is_none());
    }

    #[tokio::test]
    async fn remove_param_is_soft_everywhere() {
        let ctx = worker_ctx();
        RemoveParam::new(Handle::from_raw(404), "anything")
            .run(&ctx)
            .await
            .unwrap();

        let renderer = renderer_on(&ctx, false).await;
        RemoveParam::new(renderer, "never-set")
            .run(&ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_parks_until_render_claims_drain() {
        let ctx = worker_ctx();
        let renderer = renderer_on(&ctx, false).await;
        SetParam::new(renderer, "pixelSamples", ParamValue::Int(4))
            .run(&ctx)
            .await
            .unwrap();

        let claim = ctx.tasks().claim();
        let commit_ctx = ctx.clone();
        let commit = tokio::spawn(async move {
            CommitObject::new(renderer).run(&commit_ctx).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!commit.is_finished());
        assert!(ctx
            .handles()
            .lookup(renderer)
            .unwrap()
            .params()
            .committed("pixelSamples")
            .is_none());

        drop(claim);
        commit.await.unwrap().unwrap();
        assert!(ctx
            .handles()
            .lookup(renderer)
            .unwrap()
            .params()
            .committed("pixelSamples")
            .is_some());
    }

    #[test]
    fn set_param_round_trips_vector_values() {
        let registry = CommandRegistry::with_builtin_commands();
        let cmd = SetParam::new(
            Handle::from_raw(3),
            "backgroundColor",
            ParamValue::Vec3f([0.1, 0.2, 0.3]),
        );
        let decoded = registry.decode(encode_command(&cmd).unwrap()).unwrap();
        assert_eq!(decoded.name(), "set_param");
        assert_eq!(decoded.tag(), tags::SET_PARAM);
    }
}
