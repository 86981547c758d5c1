//! Coordinator: sole producer of the command stream and assembler of
//! worker output.
//!
//! Every public method follows the same shape: allocate any handles the
//! command needs, serialize it, broadcast it to the workers, then execute
//! the coordinator half locally. That local execution is what keeps the
//! coordinator's mirrors and query plumbing in lockstep with the stream.

use crate::command::construct::{
    NewData, NewGeometricModel, NewInstance, NewMaterial, NewObject, NewVolumetricModel,
};
use crate::command::lifecycle::{CommandFinalize, CommandRelease, LoadModule, SetLoadBalancer};
use crate::command::mutate::{CommitObject, RemoveParam, SetParam, SetParamObject, SetParamString};
use crate::command::render::{CreateFrameBuffer, Pick, RenderFrameAsync, ResetAccumulation};
use crate::command::{encode_command, Command, CommandCtx};
use crate::core::config::ClusterConfig;
use crate::core::errors::{BeamlineError, Result};
use crate::dispatch::fabric::{ChannelFabric, Fabric, ReplyInbox, WorkerLink};
use crate::handle::Handle;
use crate::object::{ColorFormat, DataFormat, ObjectKind, ParamValue, SceneObject};
use crate::render::{tile_grid, FrameReport, FrameRoutes, NullReplySink, PickGather, PickResult};
use crate::wire::WriteStream;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Assembly state for one in-flight frame on the coordinator
struct FrameAssembly {
    framebuffer: Arc<SceneObject>,
    state: Arc<SceneObject>,
    done: u32,
    tiles_expected: u32,
    tiles_applied: u32,
}

/// Reports that raced ahead of their frame's registration, stamped with
/// the completion count at first arrival
struct EarlyReports {
    reports: Vec<FrameReport>,
    since: u64,
}

struct RouterState {
    waiting: HashMap<Handle, FrameAssembly>,
    early: HashMap<Handle, EarlyReports>,
    /// Frames fully assembled so far; the expiry clock for `early`
    completions: u64,
}

/// Routes worker frame reports into the coordinator's mirror buffers and
/// completes the matching future once every worker has reported done.
/// Tile reports advance the future's progress against the frame's tile
/// grid, so coordinator-side queries track the same fraction workers see.
///
/// Registration happens on the dispatch path after the broadcast, while
/// reports arrive from a pump task, so a report may land before its frame
/// is registered; those are buffered and replayed on registration. An
/// entry nobody claims within a full frame completion is shed, since the
/// legitimate race window closes as soon as the dispatch path finishes
/// the submit that opened it.
pub struct FrameRouter {
    workers: u32,
    state: Mutex<RouterState>,
}

impl FrameRouter {
    pub fn new(workers: u32) -> Self {
        Self {
            workers: workers.max(1),
            state: Mutex::new(RouterState {
                waiting: HashMap::new(),
                early: HashMap::new(),
                completions: 0,
            }),
        }
    }

    /// Frames currently being assembled
    pub fn pending(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Early reports still waiting for a registration to claim them
    pub fn unclaimed(&self) -> usize {
        self.state.lock().early.len()
    }

    pub fn apply(&self, report: FrameReport) {
        let future = report.future();
        let mut state = self.state.lock();
        if !state.waiting.contains_key(&future) {
            trace!(future = %future, "buffering early report");
            let since = state.completions;
            state
                .early
                .entry(future)
                .or_insert_with(|| EarlyReports {
                    reports: Vec::new(),
                    since,
                })
                .reports
                .push(report);
            return;
        }

        match report {
            FrameReport::Tile { rank, block, .. } => {
                if let Some(assembly) = state.waiting.get_mut(&future) {
                    if let Some(frame) = assembly.framebuffer.as_framebuffer() {
                        match frame.write_resolved_region(
                            block.x,
                            block.y,
                            block.width,
                            block.height,
                            &block.pixels,
                        ) {
                            Ok(()) => {
                                assembly.tiles_applied += 1;
                                if assembly.tiles_expected > 0 {
                                    if let Some(progress) = assembly.state.as_future() {
                                        progress.set_progress(
                                            assembly.tiles_applied as f32
                                                / assembly.tiles_expected as f32,
                                        );
                                    }
                                }
                            }
                            Err(error) => {
                                warn!(future = %future, rank, %error, "dropping malformed tile block");
                            }
                        }
                    }
                }
            }
            FrameReport::Done { rank, .. } => {
                let mut finished = false;
                if let Some(assembly) = state.waiting.get_mut(&future) {
                    assembly.done += 1;
                    if assembly.tiles_expected == 0 {
                        if let Some(progress) = assembly.state.as_future() {
                            progress.set_progress(assembly.done as f32 / self.workers as f32);
                        }
                    }
                    finished = assembly.done >= self.workers;
                    trace!(future = %future, rank, done = assembly.done, "worker frame done");
                }
                if finished {
                    if let Some(assembly) = state.waiting.remove(&future) {
                        if let Some(frame) = assembly.framebuffer.as_framebuffer() {
                            frame.end_frame();
                        }
                        if let Some(progress) = assembly.state.as_future() {
                            progress.mark_ready();
                        }
                        debug!(future = %future, "frame assembled");
                    }
                    state.completions += 1;
                    let horizon = state.completions;
                    state.early.retain(|handle, entry| {
                        let expired = entry.since + 1 < horizon;
                        if expired {
                            warn!(
                                future = %handle,
                                reports = entry.reports.len(),
                                "shedding reports for a frame that was never registered"
                            );
                        }
                        !expired
                    });
                }
            }
        }
    }
}

impl FrameRoutes for FrameRouter {
    fn expect_frame(&self, future: Handle, framebuffer: Arc<SceneObject>, state: Arc<SceneObject>) {
        let tiles_expected = framebuffer
            .as_framebuffer()
            .map(|frame| {
                let (width, height) = frame.size();
                tile_grid(width, height).len() as u32
            })
            .unwrap_or(0);
        let buffered = {
            let mut router = self.state.lock();
            router.waiting.insert(
                future,
                FrameAssembly {
                    framebuffer,
                    state,
                    done: 0,
                    tiles_expected,
                    tiles_applied: 0,
                },
            );
            router
                .early
                .remove(&future)
                .map(|entry| entry.reports)
                .unwrap_or_default()
        };
        for report in buffered {
            self.apply(report);
        }
    }
}

/// The cluster's single command producer and public API surface
pub struct Coordinator {
    session: Uuid,
    ctx: Arc<CommandCtx>,
    fabric: Arc<ChannelFabric>,
    pump: JoinHandle<()>,
}

impl Coordinator {
    /// Build the coordinator plus one fabric link per worker. The caller
    /// spawns the worker loops from the links; until then broadcasts park
    /// once the ring fills.
    pub fn new(config: &ClusterConfig) -> Result<(Self, Vec<WorkerLink>)> {
        config.validate()?;
        let workers = config.workers.max(1) as u32;
        let (fabric, links, inbox) = ChannelFabric::new(workers, config);
        let ReplyInbox { mut frames, picks } = inbox;

        let router = Arc::new(FrameRouter::new(workers));
        let ctx = Arc::new(
            CommandCtx::coordinator(workers, config, Arc::new(NullReplySink))
                .with_frame_routes(Arc::clone(&router) as Arc<dyn FrameRoutes>)
                .with_pick_gather(PickGather::new(picks)),
        );

        // pump ends once every worker's reply sender is gone
        let pump = tokio::spawn(async move {
            while let Some(report) = frames.recv().await {
                router.apply(report);
            }
        });

        let session = Uuid::new_v4();
        debug!(session = %session, workers, "coordinator ready");
        Ok((
            Self {
                session,
                ctx,
                fabric: Arc::new(fabric),
                pump,
            },
            links,
        ))
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn context(&self) -> &Arc<CommandCtx> {
        &self.ctx
    }

    async fn submit(&self, command: &dyn Command) -> Result<()> {
        let frame = encode_command(command)?;
        trace!(
            session = %self.session,
            command = command.name(),
            bytes = frame.len(),
            "submit"
        );
        self.fabric.broadcast(frame).await?;
        command.run_on_coordinator(&self.ctx).await
    }

    pub async fn new_object(&self, kind: ObjectKind, type_name: &str) -> Result<Handle> {
        let handle = self.ctx.handles().allocate();
        self.submit(&NewObject::new(kind, type_name, handle)).await?;
        Ok(handle)
    }

    pub async fn new_renderer(&self, type_name: &str) -> Result<Handle> {
        self.new_object(ObjectKind::Renderer, type_name).await
    }

    pub async fn new_camera(&self, type_name: &str) -> Result<Handle> {
        self.new_object(ObjectKind::Camera, type_name).await
    }

    pub async fn new_world(&self) -> Result<Handle> {
        self.new_object(ObjectKind::World, "world").await
    }

    pub async fn new_group(&self) -> Result<Handle> {
        self.new_object(ObjectKind::Group, "group").await
    }

    pub async fn new_geometry(&self, type_name: &str) -> Result<Handle> {
        self.new_object(ObjectKind::Geometry, type_name).await
    }

    pub async fn new_volume(&self, type_name: &str) -> Result<Handle> {
        self.new_object(ObjectKind::Volume, type_name).await
    }

    pub async fn new_light(&self, type_name: &str) -> Result<Handle> {
        self.new_object(ObjectKind::Light, type_name).await
    }

    pub async fn new_material(&self, renderer_type: &str, material_type: &str) -> Result<Handle> {
        let handle = self.ctx.handles().allocate();
        self.submit(&NewMaterial::new(renderer_type, material_type, handle))
            .await?;
        Ok(handle)
    }

    pub async fn new_instance(&self, group: Handle) -> Result<Handle> {
        let handle = self.ctx.handles().allocate();
        self.submit(&NewInstance { handle, group }).await?;
        Ok(handle)
    }

    pub async fn new_geometric_model(&self, geometry: Handle) -> Result<Handle> {
        let handle = self.ctx.handles().allocate();
        self.submit(&NewGeometricModel { handle, geometry }).await?;
        Ok(handle)
    }

    pub async fn new_volumetric_model(&self, volume: Handle) -> Result<Handle> {
        let handle = self.ctx.handles().allocate();
        self.submit(&NewVolumetricModel { handle, volume }).await?;
        Ok(handle)
    }

    /// Create a numeric data array; the element count is derived from the
    /// payload length.
    pub async fn new_data(&self, format: DataFormat, payload: Bytes, shared: bool) -> Result<Handle> {
        let stride = format.stride();
        if format == DataFormat::Object {
            return Err(BeamlineError::configuration(
                "object arrays are created with new_object_data",
            ));
        }
        if payload.len() % stride != 0 {
            return Err(BeamlineError::configuration(format!(
                "payload of {} bytes is not a whole number of {} elements",
                payload.len(),
                format.label()
            )));
        }
        let count = (payload.len() / stride) as u64;
        let handle = self.ctx.handles().allocate();
        self.submit(&NewData {
            handle,
            format,
            count,
            shared,
            payload,
        })
        .await?;
        Ok(handle)
    }

    /// Create an array of object references from their handles
    pub async fn new_object_data(&self, members: &[Handle]) -> Result<Handle> {
        let mut w = WriteStream::with_capacity(members.len() * 8);
        for member in members {
            w.write_handle(*member);
        }
        let handle = self.ctx.handles().allocate();
        self.submit(&NewData {
            handle,
            format: DataFormat::Object,
            count: members.len() as u64,
            shared: false,
            payload: w.into_bytes(),
        })
        .await?;
        Ok(handle)
    }

    pub async fn set_param(&self, object: Handle, name: &str, value: ParamValue) -> Result<()> {
        self.submit(&SetParam::new(object, name, value)).await
    }

    pub async fn set_param_string(&self, object: Handle, name: &str, text: &str) -> Result<()> {
        self.submit(&SetParamString::new(object, name, text)).await
    }

    /// A null target clears the parameter
    pub async fn set_param_object(&self, object: Handle, name: &str, target: Handle) -> Result<()> {
        self.submit(&SetParamObject::new(object, name, target)).await
    }

    pub async fn remove_param(&self, object: Handle, name: &str) -> Result<()> {
        self.submit(&RemoveParam::new(object, name)).await
    }

    pub async fn commit(&self, object: Handle) -> Result<()> {
        self.submit(&CommitObject::new(object)).await
    }

    pub async fn release(&self, object: Handle) -> Result<()> {
        self.submit(&CommandRelease::new(object)).await
    }

    pub async fn set_load_balancer(&self, dynamic: bool, prealloc_tiles: u32) -> Result<()> {
        self.submit(&SetLoadBalancer::new(dynamic, prealloc_tiles))
            .await
    }

    /// Load an extension module everywhere; returns the coordinator's
    /// result code (zero on success).
    pub async fn load_module(&self, name: &str) -> Result<i32> {
        let command = LoadModule::new(name);
        self.submit(&command).await?;
        let code = command.result_code();
        if code != 0 {
            warn!(module = name, code, "module load failed");
        }
        Ok(code)
    }

    pub async fn create_framebuffer(
        &self,
        width: u32,
        height: u32,
        format: ColorFormat,
        channels: u32,
    ) -> Result<Handle> {
        let handle = self.ctx.handles().allocate();
        self.submit(&CreateFrameBuffer::new(handle, width, height, format, channels))
            .await?;
        Ok(handle)
    }

    pub async fn reset_accumulation(&self, framebuffer: Handle) -> Result<()> {
        self.submit(&ResetAccumulation::new(framebuffer)).await
    }

    /// Start an asynchronous frame and return its future handle
    pub async fn render_frame(
        &self,
        framebuffer: Handle,
        renderer: Handle,
        camera: Handle,
        world: Handle,
    ) -> Result<Handle> {
        let future = self.ctx.handles().allocate();
        self.submit(&RenderFrameAsync::new(
            framebuffer,
            renderer,
            camera,
            world,
            future,
        ))
        .await?;
        Ok(future)
    }

    /// Block until every worker has reported the frame done and the
    /// coordinator's assembly is complete
    pub async fn wait_render(&self, future: Handle) -> Result<()> {
        let state = self.ctx.resolve_kind(future, ObjectKind::Future)?;
        if let Some(pending) = state.as_future() {
            pending.ready().await;
        }
        Ok(())
    }

    /// Completed fraction of an in-flight frame, by worker done-reports
    pub fn render_progress(&self, future: Handle) -> Result<f32> {
        let state = self.ctx.resolve_kind(future, ObjectKind::Future)?;
        Ok(state.as_future().map(|f| f.progress()).unwrap_or(1.0))
    }

    /// Synchronous scene query: broadcasts the pick, gathers one answer
    /// per worker, and returns the closest hit.
    pub async fn pick(
        &self,
        framebuffer: Handle,
        renderer: Handle,
        camera: Handle,
        world: Handle,
        screen_x: f32,
        screen_y: f32,
    ) -> Result<Option<PickResult>> {
        let command = Pick::new(framebuffer, renderer, camera, world, screen_x, screen_y);
        self.submit(&command).await?;
        Ok(command.merged())
    }

    /// Shut the cluster down: workers exit after the finalize command,
    /// and the report pump drains before returning.
    pub async fn finalize(self) -> Result<()> {
        self.submit(&CommandFinalize).await?;
        self.fabric.close();
        self.pump.await?;
        debug!(session = %self.session, "coordinator finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{channel, ColorFormat, ObjectKind, RenderFuture};
    use crate::render::TileBlock;

    fn framebuffer_object() -> Arc<SceneObject> {
        Arc::new(SceneObject::framebuffer(
            crate::object::FrameBufferState::display_only(
                64,
                64,
                ColorFormat::Rgba32f,
                channel::COLOR,
            ),
        ))
    }

    fn future_object() -> Arc<SceneObject> {
        Arc::new(SceneObject::future(RenderFuture::new()))
    }

    #[tokio::test]
    async fn router_completes_after_every_worker_reports() {
        let router = FrameRouter::new(2);
        let future = Handle::from_raw(9);
        let state = future_object();
        router.expect_frame(future, framebuffer_object(), Arc::clone(&state));

        router.apply(FrameReport::Done { future, rank: 0 });
        assert!(!state.as_future().unwrap().is_ready());
        assert_eq!(router.pending(), 1);

        router.apply(FrameReport::Done { future, rank: 1 });
        assert!(state.as_future().unwrap().is_ready());
        assert_eq!(router.pending(), 0);
    }

    #[tokio::test]
    async fn early_reports_are_replayed_on_registration() {
        let router = FrameRouter::new(1);
        let future = Handle::from_raw(4);
        let framebuffer = framebuffer_object();
        let state = future_object();

        // report lands before the dispatch path registers the frame
        router.apply(FrameReport::Tile {
            future,
            rank: 0,
            block: TileBlock {
                x: 0,
                y: 0,
                width: 1,
                height: 1,
                pixels: vec![[0.5, 0.5, 0.5, 1.0]],
            },
        });
        router.apply(FrameReport::Done { future, rank: 0 });
        assert_eq!(router.pending(), 0);

        router.expect_frame(future, Arc::clone(&framebuffer), Arc::clone(&state));
        assert!(state.as_future().unwrap().is_ready());
        let frame = framebuffer.as_framebuffer().unwrap();
        assert_eq!(frame.frames(), 1);
    }

    #[tokio::test]
    async fn malformed_tile_blocks_are_dropped_not_applied() {
        let router = FrameRouter::new(1);
        let future = Handle::from_raw(11);
        let framebuffer = framebuffer_object();
        let state = future_object();
        router.expect_frame(future, Arc::clone(&framebuffer), Arc::clone(&state));

        // block declares a 16x16 region but carries a single pixel
        router.apply(FrameReport::Tile {
            future,
            rank: 0,
            block: TileBlock {
                x: 0,
                y: 0,
                width: 16,
                height: 16,
                pixels: vec![[1.0; 4]],
            },
        });
        let frame = framebuffer.as_framebuffer().unwrap();
        assert!(frame.color_bytes().iter().all(|byte| *byte == 0));
        assert!(!state.as_future().unwrap().is_ready());

        // the router keeps assembling the frame after the bad block
        router.apply(FrameReport::Done { future, rank: 0 });
        assert!(state.as_future().unwrap().is_ready());
        assert_eq!(router.pending(), 0);
    }

    #[tokio::test]
    async fn tile_reports_drive_frame_progress() {
        let router = FrameRouter::new(2);
        let future = Handle::from_raw(5);
        // 128x64 splits into two 64x64 tiles
        let framebuffer = Arc::new(SceneObject::framebuffer(
            crate::object::FrameBufferState::display_only(
                128,
                64,
                ColorFormat::Rgba32f,
                channel::COLOR,
            ),
        ));
        let state = future_object();
        router.expect_frame(future, Arc::clone(&framebuffer), Arc::clone(&state));
        assert_eq!(state.as_future().unwrap().progress(), 0.0);

        router.apply(FrameReport::Tile {
            future,
            rank: 0,
            block: TileBlock {
                x: 0,
                y: 0,
                width: 64,
                height: 64,
                pixels: vec![[0.5; 4]; 64 * 64],
            },
        });
        assert!((state.as_future().unwrap().progress() - 0.5).abs() < 1e-6);

        router.apply(FrameReport::Tile {
            future,
            rank: 1,
            block: TileBlock {
                x: 64,
                y: 0,
                width: 64,
                height: 64,
                pixels: vec![[0.5; 4]; 64 * 64],
            },
        });
        assert!((state.as_future().unwrap().progress() - 1.0).abs() < 1e-6);
        assert!(!state.as_future().unwrap().is_ready());

        router.apply(FrameReport::Done { future, rank: 0 });
        router.apply(FrameReport::Done { future, rank: 1 });
        assert!(state.as_future().unwrap().is_ready());
    }

    #[tokio::test]
    async fn unclaimed_early_reports_are_shed_after_a_full_frame() {
        let router = FrameRouter::new(1);
        let stray = Handle::from_raw(99);
        router.apply(FrameReport::Done {
            future: stray,
            rank: 0,
        });
        assert_eq!(router.unclaimed(), 1);

        // one completed frame later the stray is still within its window
        let first = Handle::from_raw(1);
        router.expect_frame(first, framebuffer_object(), future_object());
        router.apply(FrameReport::Done {
            future: first,
            rank: 0,
        });
        assert_eq!(router.unclaimed(), 1);

        // a second completed frame puts it past the window
        let second = Handle::from_raw(2);
        router.expect_frame(second, framebuffer_object(), future_object());
        router.apply(FrameReport::Done {
            future: second,
            rank: 0,
        });
        assert_eq!(router.unclaimed(), 0);
    }

    #[tokio::test]
    async fn coordinator_mirrors_renderer_params() {
        let config = ClusterConfig::default().with_workers(1);
        let (coordinator, links) = Coordinator::new(&config).unwrap();

        let renderer = coordinator.new_renderer("scivis").await.unwrap();
        coordinator
            .set_param_string(renderer, "aoSamples", "4")
            .await
            .unwrap();
        coordinator.commit(renderer).await.unwrap();

        let mirror = coordinator.context().handles().lookup(renderer).unwrap();
        assert_eq!(
            mirror
                .params()
                .committed("aoSamples")
                .and_then(|slot| slot.as_text().map(str::to_owned)),
            Some("4".to_owned())
        );
        drop(links);
    }

    #[tokio::test]
    async fn coordinator_tracks_stub_identities_for_unmirrored_kinds() {
        let config = ClusterConfig::default().with_workers(1);
        let (coordinator, links) = Coordinator::new(&config).unwrap();

        let world = coordinator.new_world().await.unwrap();
        let mirror = coordinator.context().handles().lookup(world).unwrap();
        assert_eq!(mirror.kind(), ObjectKind::World);
        assert!(mirror.roster().is_none());
        drop(links);
    }
}
