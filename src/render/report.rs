//! Worker-to-coordinator reporting: rendered tile blocks, frame completion,
//! and pick answers.
//!
//! Commands run against a `ReplySink` rather than a concrete transport so
//! the same command code serves the in-process fabric and tests alike.

use crate::core::errors::Result;
use crate::handle::Handle;
use crate::object::SceneObject;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One resolved pixel block for a rectangular frame buffer region
#[derive(Debug, Clone)]
pub struct TileBlock {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
}

/// Progress message for one asynchronous frame, keyed by future handle
#[derive(Debug, Clone)]
pub enum FrameReport {
    Tile {
        future: Handle,
        rank: u32,
        block: TileBlock,
    },
    /// The reporting worker has finished every tile it owns for this frame
    Done { future: Handle, rank: u32 },
}

impl FrameReport {
    pub fn future(&self) -> Handle {
        match self {
            Self::Tile { future, .. } | Self::Done { future, .. } => *future,
        }
    }

    pub fn rank(&self) -> u32 {
        match self {
            Self::Tile { rank, .. } | Self::Done { rank, .. } => *rank,
        }
    }
}

/// Closest primary-surface hit found for a screen position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickResult {
    pub world_position: [f32; 3],
    pub distance: f32,
}

/// One worker's answer to a pick query; `None` means no hit locally
#[derive(Debug, Clone)]
pub struct PickReport {
    pub rank: u32,
    pub result: Option<PickResult>,
}

/// Upstream channel from a worker to the coordinator
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_frame(&self, report: FrameReport) -> Result<()>;
    async fn send_pick(&self, report: PickReport) -> Result<()>;
}

/// Sink that swallows reports; used by the coordinator's own context and by
/// tests that exercise commands without a cluster.
pub struct NullReplySink;

#[async_trait]
impl ReplySink for NullReplySink {
    async fn send_frame(&self, _report: FrameReport) -> Result<()> {
        Ok(())
    }

    async fn send_pick(&self, _report: PickReport) -> Result<()> {
        Ok(())
    }
}

/// Coordinator-side registration point for frames whose reports are about
/// to arrive. Registration happens after the command broadcast, so
/// implementations must tolerate reports that land first.
pub trait FrameRoutes: Send + Sync {
    fn expect_frame(&self, future: Handle, framebuffer: Arc<SceneObject>, state: Arc<SceneObject>);
}

/// Collects exactly one pick answer per worker.
///
/// Commands are totally ordered, so workers answer pick queries in
/// submission order and a plain one-recv-per-worker sweep cannot mix
/// answers from different picks.
pub struct PickGather {
    receivers: Mutex<Vec<mpsc::Receiver<PickReport>>>,
}

impl PickGather {
    pub fn new(receivers: Vec<mpsc::Receiver<PickReport>>) -> Self {
        Self {
            receivers: Mutex::new(receivers),
        }
    }

    /// One report per live worker; workers whose channel has closed are
    /// skipped and surface through the dispatch loop instead.
    pub async fn collect(&self) -> Vec<PickReport> {
        let mut receivers = self.receivers.lock().await;
        let mut reports = Vec::with_capacity(receivers.len());
        for rx in receivers.iter_mut() {
            if let Some(report) = rx.recv().await {
                reports.push(report);
            }
        }
        reports
    }
}
