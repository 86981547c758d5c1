//! Tile scheduling and frame rendering on worker processes.
//!
//! Every worker sees the full scene, so scheduling is pure bookkeeping:
//! the frame is cut into fixed-size tiles and each worker renders the
//! subset it owns, streaming resolved blocks back to the coordinator.
//! The static policy interleaves tiles across workers deterministically;
//! the dynamic policy hands out contiguous pre-allocation chunks and fans
//! shading out over a task pool inside each worker.

pub mod report;

pub use self::report::{
    FrameReport, FrameRoutes, NullReplySink, PickGather, PickReport, PickResult, ReplySink,
    TileBlock,
};

use crate::core::errors::{BeamlineError, Result};
use crate::handle::Handle;
use crate::object::{
    CameraModel, ObjectKind, ParamSlot, ParamValue, RendererFlavor, SceneObject, TaskClaim,
};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Edge length of the square scheduling unit, in pixels
pub const TILE_SIZE: u32 = 64;

/// One rectangular scheduling unit; edge tiles are clipped to the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub index: u32,
}

/// Row-major tile decomposition of a frame
pub fn tile_grid(width: u32, height: u32) -> Vec<Tile> {
    let mut tiles = Vec::new();
    let mut index = 0;
    let mut y = 0;
    while y < height {
        let tile_height = TILE_SIZE.min(height - y);
        let mut x = 0;
        while x < width {
            tiles.push(Tile {
                x,
                y,
                width: TILE_SIZE.min(width - x),
                height: tile_height,
                index,
            });
            index += 1;
            x += TILE_SIZE;
        }
        y += TILE_SIZE;
    }
    tiles
}

/// Tile distribution policy shared by all processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub dynamic: bool,
    pub prealloc_tiles: u32,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            dynamic: true,
            prealloc_tiles: 4,
        }
    }
}

/// Tiles owned by one worker under the given policy. Ownership is a pure
/// function of the grid, so workers agree without negotiating.
pub fn assign_tiles(tiles: &[Tile], rank: u32, workers: u32, policy: &SchedulePolicy) -> Vec<Tile> {
    let workers = workers.max(1);
    if policy.dynamic {
        let chunk = policy.prealloc_tiles.max(1) as usize;
        tiles
            .chunks(chunk)
            .enumerate()
            .filter(|(i, _)| (*i as u32) % workers == rank)
            .flat_map(|(_, chunk)| chunk.iter().copied())
            .collect()
    } else {
        tiles
            .iter()
            .filter(|tile| tile.index % workers == rank)
            .copied()
            .collect()
    }
}

/// Resolved object references for one frame or pick query
#[derive(Clone)]
pub struct SceneView {
    pub framebuffer: Arc<SceneObject>,
    pub renderer: Arc<SceneObject>,
    pub camera: Arc<SceneObject>,
    pub world: Arc<SceneObject>,
}

impl SceneView {
    pub fn frame_size(&self) -> (u32, u32) {
        self.framebuffer
            .as_framebuffer()
            .map(|state| state.size())
            .unwrap_or((0, 0))
    }

    pub fn flavor(&self) -> RendererFlavor {
        self.renderer
            .renderer_flavor()
            .unwrap_or(RendererFlavor::SciVis)
    }

    pub fn camera_model(&self) -> CameraModel {
        self.camera.camera_model().unwrap_or(CameraModel::Perspective)
    }

    /// Number of committed members in the world roster
    pub fn world_members(&self) -> usize {
        self.world.roster().map(|roster| roster.len()).unwrap_or(0)
    }

    /// Committed background color, or the renderer flavor's default
    pub fn background(&self) -> [f32; 4] {
        match self.renderer.params().committed("backgroundColor") {
            Some(ParamSlot::Value(ParamValue::Vec4f(c))) => c,
            Some(ParamSlot::Value(ParamValue::Vec3f(c))) => [c[0], c[1], c[2], 1.0],
            _ => match self.flavor() {
                RendererFlavor::SciVis => [0.1, 0.1, 0.1, 1.0],
                RendererFlavor::PathTracer => [0.0, 0.0, 0.0, 1.0],
                RendererFlavor::Debug => [0.0, 0.0, 0.0, 1.0],
            },
        }
    }

    /// Committed ambient-occlusion sample count; string values are parsed
    pub fn ao_samples(&self) -> u32 {
        match self.renderer.params().committed("aoSamples") {
            Some(ParamSlot::Text(text)) => text.trim().parse().unwrap_or(0),
            Some(ParamSlot::Value(ParamValue::Int(n))) => n.max(0) as u32,
            _ => 0,
        }
    }
}

/// Shaded output for one tile
pub struct TileShading {
    pub pixels: Vec<[f32; 4]>,
    pub depth: Option<Vec<f32>>,
}

/// Per-tile shading backend
pub trait RenderKernel: Send + Sync {
    fn shade_tile(&self, view: &SceneView, tile: Tile, frame_index: u32) -> TileShading;
}

/// Built-in analytic kernel: shades a view-filling disk for non-empty
/// worlds and the flat background otherwise. Deterministic per seed, with
/// per-frame jitter in the occlusion term so accumulation converges.
pub struct PreviewKernel;

impl RenderKernel for PreviewKernel {
    fn shade_tile(&self, view: &SceneView, tile: Tile, frame_index: u32) -> TileShading {
        let (frame_width, frame_height) = view.frame_size();
        let flavor = view.flavor();
        let background = view.background();
        let populated = view.world_members() > 0;
        let ao_samples = view.ao_samples();
        let radius_sq = camera_disk_radius(view.camera_model()).powi(2);
        let base = match flavor {
            RendererFlavor::SciVis => [0.25, 0.55, 0.85],
            RendererFlavor::PathTracer => [0.85, 0.62, 0.30],
            RendererFlavor::Debug => [1.0, 0.0, 1.0],
        };

        let mut rng =
            fastrand::Rng::with_seed(((frame_index as u64) << 32) | tile.index as u64);
        let count = (tile.width * tile.height) as usize;
        let mut pixels = Vec::with_capacity(count);
        let mut depth = Vec::with_capacity(count);

        for row in 0..tile.height {
            for col in 0..tile.width {
                let px = tile.x + col;
                let py = tile.y + row;

                if flavor == RendererFlavor::Debug {
                    let lit = (px / 8 + py / 8) % 2 == 0;
                    pixels.push(if lit { [base[0], base[1], base[2], 1.0] } else { background });
                    depth.push(f32::INFINITY);
                    continue;
                }

                let (ndc_x, ndc_y) = pixel_to_ndc(px, py, frame_width, frame_height);
                let r_sq = ndc_x * ndc_x + ndc_y * ndc_y;
                if populated && r_sq <= radius_sq {
                    let shade = 1.0 - r_sq / radius_sq;
                    let occlusion = if ao_samples > 0 {
                        let mut sum = 0.0;
                        for _ in 0..ao_samples {
                            sum += 1.0 - rng.f32() * (r_sq / radius_sq);
                        }
                        sum / ao_samples as f32
                    } else {
                        1.0
                    };
                    pixels.push([
                        base[0] * shade * occlusion,
                        base[1] * shade * occlusion,
                        base[2] * shade * occlusion,
                        1.0,
                    ]);
                    depth.push(1.0 + r_sq);
                } else {
                    pixels.push(background);
                    depth.push(f32::INFINITY);
                }
            }
        }

        TileShading {
            pixels,
            depth: Some(depth),
        }
    }
}

fn camera_disk_radius(model: CameraModel) -> f32 {
    match model {
        CameraModel::Perspective => 0.5,
        CameraModel::Orthographic => 0.6,
        CameraModel::Panoramic => 0.7,
    }
}

fn pixel_to_ndc(px: u32, py: u32, width: u32, height: u32) -> (f32, f32) {
    let x = ((px as f32 + 0.5) / width.max(1) as f32) * 2.0 - 1.0;
    let y = ((py as f32 + 0.5) / height.max(1) as f32) * 2.0 - 1.0;
    (x, y)
}

/// Ray query against the committed world, using the same analytic surface
/// the preview kernel shades. Screen coordinates are normalized to `[0, 1]`.
pub fn pick_world(view: &SceneView, screen_x: f32, screen_y: f32) -> Option<PickResult> {
    if view.world_members() == 0 {
        return None;
    }
    if !(0.0..=1.0).contains(&screen_x) || !(0.0..=1.0).contains(&screen_y) {
        return None;
    }
    let ndc_x = screen_x * 2.0 - 1.0;
    let ndc_y = screen_y * 2.0 - 1.0;
    let r_sq = ndc_x * ndc_x + ndc_y * ndc_y;
    let radius_sq = camera_disk_radius(view.camera_model()).powi(2);
    if r_sq > radius_sq {
        return None;
    }
    let distance = 1.0 + r_sq;
    Some(PickResult {
        world_position: [ndc_x, ndc_y, distance],
        distance,
    })
}

/// Closest hit across per-worker answers
pub fn merge_pick_reports(reports: &[PickReport]) -> Option<PickResult> {
    reports
        .iter()
        .filter_map(|report| report.result)
        .min_by(|a, b| a.distance.total_cmp(&b.distance))
}

/// One worker's share of one asynchronous frame.
///
/// The job owns a task claim for its whole lifetime, which is what blocks
/// state-mutating commands from running while the frame is in flight.
pub struct RenderJob {
    view: SceneView,
    future: Handle,
    future_state: Arc<SceneObject>,
    policy: SchedulePolicy,
    rank: u32,
    workers: u32,
    shading_tasks: usize,
    kernel: Arc<dyn RenderKernel>,
    reply: Arc<dyn ReplySink>,
    _claim: TaskClaim,
}

impl RenderJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        view: SceneView,
        future: Handle,
        future_state: Arc<SceneObject>,
        policy: SchedulePolicy,
        rank: u32,
        workers: u32,
        shading_tasks: usize,
        kernel: Arc<dyn RenderKernel>,
        reply: Arc<dyn ReplySink>,
        claim: TaskClaim,
    ) -> Self {
        Self {
            view,
            future,
            future_state,
            policy,
            rank,
            workers,
            shading_tasks,
            kernel,
            reply,
            _claim: claim,
        }
    }

    /// Render every owned tile, stream the resolved blocks upstream, and
    /// signal completion on the worker-local future. The future is marked
    /// ready even when rendering fails, so local waiters never hang on a
    /// frame that will not finish.
    pub async fn run(self) -> Result<()> {
        let outcome = self.render_frame().await;
        if let Some(state) = self.future_state.as_future() {
            state.mark_ready();
        }
        outcome
    }

    async fn render_frame(&self) -> Result<()> {
        let frame = self
            .view
            .framebuffer
            .as_framebuffer()
            .ok_or_else(|| BeamlineError::internal("render target is not a frame buffer"))?;
        let (width, height) = frame.size();
        let grid = tile_grid(width, height);
        let owned = assign_tiles(&grid, self.rank, self.workers, &self.policy);
        let frame_index = frame.frames();

        if self.policy.dynamic && self.shading_tasks > 1 && owned.len() > 1 {
            self.run_fanned_out(&owned, frame_index).await?;
        } else {
            self.run_sequential(&owned, frame_index).await?;
        }

        frame.end_frame();
        self.reply
            .send_frame(FrameReport::Done {
                future: self.future,
                rank: self.rank,
            })
            .await?;
        debug!(
            rank = self.rank,
            future = %self.future,
            tiles = owned.len(),
            frame = frame_index,
            "frame complete"
        );
        Ok(())
    }

    async fn run_sequential(&self, owned: &[Tile], frame_index: u32) -> Result<()> {
        for (done, tile) in owned.iter().enumerate() {
            shade_and_report(
                &self.view,
                self.kernel.as_ref(),
                self.reply.as_ref(),
                *tile,
                frame_index,
                self.future,
                self.rank,
            )
            .await?;
            if let Some(state) = self.future_state.as_future() {
                state.set_progress((done + 1) as f32 / owned.len() as f32);
            }
        }
        Ok(())
    }

    async fn run_fanned_out(&self, owned: &[Tile], frame_index: u32) -> Result<()> {
        let queue = Arc::new(SegQueue::new());
        for tile in owned {
            queue.push(*tile);
        }
        let completed = Arc::new(AtomicUsize::new(0));
        let total = owned.len();
        let tasks = self.shading_tasks.min(total);

        let mut joins = Vec::with_capacity(tasks);
        for _ in 0..tasks {
            let queue = Arc::clone(&queue);
            let view = self.view.clone();
            let kernel = Arc::clone(&self.kernel);
            let reply = Arc::clone(&self.reply);
            let completed = Arc::clone(&completed);
            let future_state = Arc::clone(&self.future_state);
            let future = self.future;
            let rank = self.rank;
            joins.push(tokio::spawn(async move {
                while let Some(tile) = queue.pop() {
                    shade_and_report(
                        &view,
                        kernel.as_ref(),
                        reply.as_ref(),
                        tile,
                        frame_index,
                        future,
                        rank,
                    )
                    .await?;
                    let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                    if let Some(state) = future_state.as_future() {
                        state.set_progress(done as f32 / total as f32);
                    }
                }
                Ok::<(), BeamlineError>(())
            }));
        }
        for join in joins {
            join.await??;
        }
        Ok(())
    }
}

async fn shade_and_report(
    view: &SceneView,
    kernel: &dyn RenderKernel,
    reply: &dyn ReplySink,
    tile: Tile,
    frame_index: u32,
    future: Handle,
    rank: u32,
) -> Result<()> {
    let frame = view
        .framebuffer
        .as_framebuffer()
        .ok_or_else(|| BeamlineError::internal("render target is not a frame buffer"))?;
    let shading = kernel.shade_tile(view, tile, frame_index);
    let resolved = frame.accumulate_region(
        tile.x,
        tile.y,
        tile.width,
        tile.height,
        &shading.pixels,
        shading.depth.as_deref(),
    )?;
    reply
        .send_frame(FrameReport::Tile {
            future,
            rank,
            block: TileBlock {
                x: tile.x,
                y: tile.y,
                width: tile.width,
                height: tile.height,
                pixels: resolved,
            },
        })
        .await
}
