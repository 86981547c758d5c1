//! Single-process cluster harness: one coordinator plus N worker loops
//! running as tasks on the same runtime.

use crate::command::{CommandCtx, CommandRegistry};
use crate::core::config::ClusterConfig;
use crate::core::errors::{BeamlineError, Result};
use crate::dispatch::coordinator::Coordinator;
use crate::dispatch::worker::run_worker;
use crate::render::ReplySink;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// A running cluster. Worker state is owned by the spawned loops; the
/// only way in is through the coordinator's command stream.
pub struct LocalCluster {
    coordinator: Coordinator,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl LocalCluster {
    pub fn start(config: &ClusterConfig) -> Result<Self> {
        let (coordinator, links) = Coordinator::new(config)?;
        let worker_count = config.workers.max(1) as u32;

        let mut workers = Vec::with_capacity(links.len());
        for link in links {
            let ctx = Arc::new(CommandCtx::worker(
                link.rank,
                worker_count,
                config,
                link.reply as Arc<dyn ReplySink>,
            ));
            let registry = CommandRegistry::with_builtin_commands();
            workers.push(tokio::spawn(run_worker(ctx, registry, link.commands)));
        }

        info!(
            session = %coordinator.session(),
            workers = workers.len(),
            "local cluster started"
        );
        Ok(Self {
            coordinator,
            workers,
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Finalize the command stream and join every worker. The first
    /// worker failure is returned with its rank attached.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            coordinator,
            workers,
        } = self;
        coordinator.finalize().await?;

        for (rank, joined) in join_all(workers).await.into_iter().enumerate() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    return Err(BeamlineError::worker(rank as u32, error.to_string()))
                }
                Err(join) => return Err(join.into()),
            }
        }
        Ok(())
    }
}
