//! Frame buffer, render, and pick commands.
//!
//! These are the asymmetric heart of the protocol: workers shade tiles and
//! stream reports upstream, while the coordinator binds the same future
//! handle to its own assembly bookkeeping and answers synchronous queries
//! by merging per-worker replies.

use crate::command::context::CommandCtx;
use crate::command::registry::{CommandRegistry, COMMAND_CATALOG};
use crate::command::{tags, Command};
use crate::core::errors::{ProtocolError, Result};
use crate::handle::Handle;
use crate::object::{ColorFormat, FrameBufferState, ObjectKind, RenderFuture, SceneObject};
use crate::render::{merge_pick_reports, pick_world, PickReport, PickResult, RenderJob, SceneView};
use crate::wire::{ReadStream, WriteStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bind a frame buffer of a given size, pixel format, and channel set.
///
/// Workers keep the accumulation and variance planes; the coordinator's
/// copy holds resolved pixels only, sized for final-image assembly.
#[derive(Debug)]
pub struct CreateFrameBuffer {
    pub handle: Handle,
    pub width: u32,
    pub height: u32,
    pub format: ColorFormat,
    pub channels: u32,
}

impl CreateFrameBuffer {
    pub fn new(handle: Handle, width: u32, height: u32, format: ColorFormat, channels: u32) -> Self {
        Self {
            handle,
            width,
            height,
            format,
            channels,
        }
    }
}

impl Default for CreateFrameBuffer {
    fn default() -> Self {
        Self::new(Handle::NULL, 0, 0, ColorFormat::Rgba8, 0)
    }
}

#[async_trait]
impl Command for CreateFrameBuffer {
    fn tag(&self) -> u64 {
        tags::CREATE_FRAME_BUFFER
    }

    fn name(&self) -> &'static str {
        "create_frame_buffer"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.handle);
        w.write_u32(self.width);
        w.write_u32(self.height);
        w.write_u32(self.format.to_u32());
        w.write_u32(self.channels);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.handle = r.read_handle()?;
        self.width = r.read_u32()?;
        self.height = r.read_u32()?;
        let raw = r.read_u32()?;
        self.format = ColorFormat::from_u32(raw)
            .ok_or_else(|| ProtocolError::malformed("format", format!("unknown color format {raw}")))?;
        self.channels = r.read_u32()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let state =
            FrameBufferState::with_accumulation(self.width, self.height, self.format, self.channels);
        ctx.handles()
            .bind(self.handle, Arc::new(SceneObject::framebuffer(state)))?;
        debug!(
            handle = %self.handle,
            width = self.width,
            height = self.height,
            "frame buffer created"
        );
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let state = FrameBufferState::display_only(self.width, self.height, self.format, self.channels);
        ctx.handles()
            .bind(self.handle, Arc::new(SceneObject::framebuffer(state)))?;
        Ok(())
    }
}

/// Clear accumulation state so the next frame starts refinement from
/// scratch. The clear must not overlap an in-flight frame's samples, so
/// the dispatch loop parks until render claims drain.
#[derive(Debug, Default)]
pub struct ResetAccumulation {
    pub framebuffer: Handle,
}

impl ResetAccumulation {
    pub fn new(framebuffer: Handle) -> Self {
        Self { framebuffer }
    }
}

#[async_trait]
impl Command for ResetAccumulation {
    fn tag(&self) -> u64 {
        tags::RESET_ACCUMULATION
    }

    fn name(&self) -> &'static str {
        "reset_accumulation"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.framebuffer);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.framebuffer = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = ctx.resolve_kind(self.framebuffer, ObjectKind::FrameBuffer)?;
        ctx.tasks().wait_idle().await;
        if let Some(state) = object.as_framebuffer() {
            state.reset_accumulation();
        }
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let object = ctx.resolve_kind(self.framebuffer, ObjectKind::FrameBuffer)?;
        if let Some(state) = object.as_framebuffer() {
            state.reset_accumulation();
        }
        Ok(())
    }
}

/// Start one asynchronous frame.
///
/// The future handle is allocated by the coordinator before the broadcast,
/// so every process binds completion state under the same identifier. The
/// render job holds references to everything it reads; a release arriving
/// mid-frame only drops table entries, never the storage underneath the
/// job.
#[derive(Debug, Default)]
pub struct RenderFrameAsync {
    pub framebuffer: Handle,
    pub renderer: Handle,
    pub camera: Handle,
    pub world: Handle,
    pub future: Handle,
}

impl RenderFrameAsync {
    pub fn new(
        framebuffer: Handle,
        renderer: Handle,
        camera: Handle,
        world: Handle,
        future: Handle,
    ) -> Self {
        Self {
            framebuffer,
            renderer,
            camera,
            world,
            future,
        }
    }

    fn resolve_view(&self, ctx: &CommandCtx) -> Result<SceneView> {
        Ok(SceneView {
            framebuffer: ctx.resolve_kind(self.framebuffer, ObjectKind::FrameBuffer)?,
            renderer: ctx.resolve_kind(self.renderer, ObjectKind::Renderer)?,
            camera: ctx.resolve_kind(self.camera, ObjectKind::Camera)?,
            world: ctx.resolve_kind(self.world, ObjectKind::World)?,
        })
    }
}

#[async_trait]
impl Command for RenderFrameAsync {
    fn tag(&self) -> u64 {
        tags::RENDER_FRAME_ASYNC
    }

    fn name(&self) -> &'static str {
        "render_frame_async"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.framebuffer);
        w.write_handle(self.renderer);
        w.write_handle(self.camera);
        w.write_handle(self.world);
        w.write_handle(self.future);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.framebuffer = r.read_handle()?;
        self.renderer = r.read_handle()?;
        self.camera = r.read_handle()?;
        self.world = r.read_handle()?;
        self.future = r.read_handle()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let view = self.resolve_view(ctx)?;
        let future_state = Arc::new(SceneObject::future(RenderFuture::new()));
        ctx.handles().bind(self.future, Arc::clone(&future_state))?;

        let policy = ctx.scheduler().policy();
        let rank = ctx.role().worker_rank().unwrap_or(0);
        let job = RenderJob::new(
            view,
            self.future,
            future_state,
            policy,
            rank,
            ctx.workers(),
            ctx.shading_tasks(),
            ctx.kernel(),
            ctx.reply(),
            ctx.tasks().claim(),
        );

        if policy.dynamic {
            let future = self.future;
            tokio::spawn(async move {
                if let Err(error) = job.run().await {
                    warn!(%error, future = %future, "render job failed");
                }
            });
        } else {
            job.run().await?;
        }
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let framebuffer = ctx.resolve_kind(self.framebuffer, ObjectKind::FrameBuffer)?;
        let future_state = Arc::new(SceneObject::future(RenderFuture::new()));
        ctx.handles().bind(self.future, Arc::clone(&future_state))?;

        match ctx.frame_routes() {
            Some(routes) => routes.expect_frame(self.future, framebuffer, future_state),
            // no report path attached means nothing will arrive to assemble
            None => {
                if let Some(state) = future_state.as_future() {
                    state.mark_ready();
                }
            }
        }
        Ok(())
    }
}

/// Ray query at a normalized screen position.
///
/// Workers each answer for their own scene partition; the coordinator
/// collects one answer per worker and keeps the closest hit. The merged
/// result lands on the command itself for the caller to read back.
#[derive(Debug, Default)]
pub struct Pick {
    pub framebuffer: Handle,
    pub renderer: Handle,
    pub camera: Handle,
    pub world: Handle,
    pub screen_x: f32,
    pub screen_y: f32,
    merged: Mutex<Option<PickResult>>,
}

impl Pick {
    pub fn new(
        framebuffer: Handle,
        renderer: Handle,
        camera: Handle,
        world: Handle,
        screen_x: f32,
        screen_y: f32,
    ) -> Self {
        Self {
            framebuffer,
            renderer,
            camera,
            world,
            screen_x,
            screen_y,
            merged: Mutex::new(None),
        }
    }

    /// Merged result recorded by `run_on_coordinator`
    pub fn merged(&self) -> Option<PickResult> {
        *self.merged.lock()
    }
}

#[async_trait]
impl Command for Pick {
    fn tag(&self) -> u64 {
        tags::PICK
    }

    fn name(&self) -> &'static str {
        "pick"
    }

    fn serialize(&self, w: &mut WriteStream) -> Result<(), ProtocolError> {
        w.write_handle(self.framebuffer);
        w.write_handle(self.renderer);
        w.write_handle(self.camera);
        w.write_handle(self.world);
        w.write_f32(self.screen_x);
        w.write_f32(self.screen_y);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut ReadStream) -> Result<(), ProtocolError> {
        self.framebuffer = r.read_handle()?;
        self.renderer = r.read_handle()?;
        self.camera = r.read_handle()?;
        self.world = r.read_handle()?;
        self.screen_x = r.read_f32()?;
        self.screen_y = r.read_f32()?;
        Ok(())
    }

    async fn run(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let view = SceneView {
            framebuffer: ctx.resolve_kind(self.framebuffer, ObjectKind::FrameBuffer)?,
            renderer: ctx.resolve_kind(self.renderer, ObjectKind::Renderer)?,
            camera: ctx.resolve_kind(self.camera, ObjectKind::Camera)?,
            world: ctx.resolve_kind(self.world, ObjectKind::World)?,
        };
        let result = pick_world(&view, self.screen_x, self.screen_y);
        let rank = ctx.role().worker_rank().unwrap_or(0);
        ctx.reply().send_pick(PickReport { rank, result }).await?;
        Ok(())
    }

    async fn run_on_coordinator(&self, ctx: &Arc<CommandCtx>) -> Result<()> {
        let merged = match ctx.pick_gather() {
            Some(gather) => merge_pick_reports(&gather.collect().await),
            None => None,
        };
        *self.merged.lock() = merged;
        Ok(())
    }
}

#[linkme::distributed_slice(COMMAND_CATALOG)]
static REGISTER_RENDER: fn(&mut CommandRegistry) = register;

fn register(registry: &mut CommandRegistry) {
    registry.register(tags::CREATE_FRAME_BUFFER, || {
        Box::new(CreateFrameBuffer::default())
    });
    registry.register(tags::RESET_ACCUMULATION, || {
        Box::new(ResetAccumulation::default())
    });
    registry.register(tags::RENDER_FRAME_ASYNC, || {
        Box::new(RenderFrameAsync::default())
    });
    registry.register(tags::PICK, || Box::new(Pick::default()));
}
