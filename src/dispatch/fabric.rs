//! In-process message fabric between the coordinator and its workers.
//!
//! The command plane is a bounded broadcast ring delivering every frame to
//! every worker in submission order; a full ring backpressures the
//! coordinator instead of dropping. The reply plane runs the other way:
//! one shared queue for frame reports and one dedicated pick channel per
//! worker, so ordered query answers never interleave across workers.

use crate::core::config::ClusterConfig;
use crate::core::errors::{BeamlineError, Result};
use crate::render::{FrameReport, PickReport, ReplySink};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use std::sync::Arc;

/// Ordered, reliable command delivery to every worker
#[async_trait]
pub trait Fabric: Send + Sync {
    async fn broadcast(&self, frame: Bytes) -> Result<()>;
}

/// Worker-side reply path back to the coordinator
pub struct WorkerChannel {
    rank: u32,
    frames: mpsc::Sender<FrameReport>,
    picks: mpsc::Sender<PickReport>,
}

impl WorkerChannel {
    pub fn rank(&self) -> u32 {
        self.rank
    }
}

#[async_trait]
impl ReplySink for WorkerChannel {
    async fn send_frame(&self, report: FrameReport) -> Result<()> {
        self.frames
            .send(report)
            .await
            .map_err(|_| BeamlineError::fabric("frame report", closed(self.rank)))
    }

    async fn send_pick(&self, report: PickReport) -> Result<()> {
        self.picks
            .send(report)
            .await
            .map_err(|_| BeamlineError::fabric("pick report", closed(self.rank)))
    }
}

fn closed(rank: u32) -> anyhow::Error {
    anyhow::anyhow!("coordinator hung up on worker {rank}")
}

/// Everything one worker needs to join the cluster
pub struct WorkerLink {
    pub rank: u32,
    pub commands: async_broadcast::Receiver<Bytes>,
    pub reply: Arc<WorkerChannel>,
}

/// Coordinator-side receiving ends, created together with the fabric
pub struct ReplyInbox {
    pub frames: mpsc::Receiver<FrameReport>,
    pub picks: Vec<mpsc::Receiver<PickReport>>,
}

/// Channel-backed fabric for a single-process cluster
pub struct ChannelFabric {
    commands: async_broadcast::Sender<Bytes>,
    // keeps the ring open while no worker is mid-recv
    _keepalive: async_broadcast::InactiveReceiver<Bytes>,
}

impl ChannelFabric {
    pub fn new(workers: u32, config: &ClusterConfig) -> (Self, Vec<WorkerLink>, ReplyInbox) {
        let (commands_tx, commands_rx) = async_broadcast::broadcast(config.channel_capacity.max(1));
        let (frames_tx, frames_rx) = mpsc::channel(config.report_capacity.max(1));

        let mut links = Vec::with_capacity(workers as usize);
        let mut picks = Vec::with_capacity(workers as usize);
        for rank in 0..workers {
            let (pick_tx, pick_rx) = mpsc::channel(config.report_capacity.max(1));
            picks.push(pick_rx);
            links.push(WorkerLink {
                rank,
                commands: commands_rx.clone(),
                reply: Arc::new(WorkerChannel {
                    rank,
                    frames: frames_tx.clone(),
                    picks: pick_tx,
                }),
            });
        }

        let fabric = Self {
            commands: commands_tx,
            _keepalive: commands_rx.deactivate(),
        };
        (
            fabric,
            links,
            ReplyInbox {
                frames: frames_rx,
                picks,
            },
        )
    }

    /// Close the command plane; workers drain what is buffered and exit
    pub fn close(&self) {
        self.commands.close();
    }
}

#[async_trait]
impl Fabric for ChannelFabric {
    async fn broadcast(&self, frame: Bytes) -> Result<()> {
        self.commands
            .broadcast(frame)
            .await
            .map(|_| ())
            .map_err(|_| BeamlineError::fabric("broadcast", anyhow::anyhow!("command ring closed")))
    }
}
