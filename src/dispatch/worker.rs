//! Worker-side dispatch loop: the sequential consumer of the command plane.

use crate::command::{CommandCtx, CommandRegistry};
use crate::core::errors::{BeamlineError, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Consume command frames in delivery order until the stream ends, a
/// finalize command arrives, or a fatal error poisons the stream.
///
/// Commands execute one at a time; nothing here reorders or overlaps
/// them. Non-fatal failures are logged and the loop keeps consuming,
/// because the coordinator never hears about soft failures through the
/// command plane. Fatal failures abort the worker: once decoding or
/// handle resolution goes wrong the remaining byte stream cannot be
/// trusted.
pub async fn run_worker(
    ctx: Arc<CommandCtx>,
    registry: CommandRegistry,
    mut commands: async_broadcast::Receiver<Bytes>,
) -> Result<()> {
    let rank = ctx.role().worker_rank().unwrap_or(0);
    debug!(rank, commands = registry.len(), "worker dispatch loop started");

    loop {
        let frame = match commands.recv().await {
            Ok(frame) => frame,
            Err(async_broadcast::RecvError::Closed) => {
                debug!(rank, "command ring closed");
                break;
            }
            Err(async_broadcast::RecvError::Overflowed(missed)) => {
                error!(rank, missed, "command ring overflowed");
                return Err(BeamlineError::worker(
                    rank,
                    format!("command ring dropped {missed} frames"),
                ));
            }
        };

        let command = match registry.decode(frame) {
            Ok(command) => command,
            Err(error) => {
                error!(rank, %error, "undecodable command frame");
                return Err(error.into());
            }
        };

        trace!(rank, command = command.name(), "dispatch");
        if let Err(error) = command.run(&ctx).await {
            if error.is_fatal() {
                error!(rank, command = command.name(), %error, "fatal command failure");
                return Err(error);
            }
            warn!(
                rank,
                command = command.name(),
                category = error.category(),
                %error,
                "command failed"
            );
        }

        if ctx.shutdown_requested() {
            debug!(rank, "worker finalized");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::lifecycle::CommandFinalize;
    use crate::command::{encode_command, tags};
    use crate::core::config::ClusterConfig;
    use crate::core::errors::BeamlineError;
    use crate::dispatch::fabric::{ChannelFabric, Fabric};
    use crate::render::NullReplySink;
    use crate::wire::WriteStream;

    fn harness() -> (ChannelFabric, Arc<CommandCtx>, async_broadcast::Receiver<Bytes>) {
        let config = ClusterConfig::default();
        let (fabric, mut links, _inbox) = ChannelFabric::new(1, &config);
        let link = links.remove(0);
        let ctx = Arc::new(CommandCtx::worker(
            link.rank,
            1,
            &config,
            link.reply.clone() as Arc<dyn crate::render::ReplySink>,
        ));
        (fabric, ctx, link.commands)
    }

    #[tokio::test]
    async fn finalize_ends_the_loop_cleanly() {
        let (fabric, ctx, commands) = harness();
        let worker = tokio::spawn(run_worker(
            ctx,
            CommandRegistry::with_builtin_commands(),
            commands,
        ));

        fabric
            .broadcast(encode_command(&CommandFinalize).unwrap())
            .await
            .unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_the_ring_ends_the_loop() {
        let (fabric, ctx, commands) = harness();
        let worker = tokio::spawn(run_worker(
            ctx,
            CommandRegistry::with_builtin_commands(),
            commands,
        ));

        fabric.close();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_tag_aborts_the_worker() {
        let (fabric, ctx, commands) = harness();
        let worker = tokio::spawn(run_worker(
            ctx,
            CommandRegistry::with_builtin_commands(),
            commands,
        ));

        let mut w = WriteStream::new();
        w.write_u64(9999);
        w.write_u32(0xdead_beef);
        fabric.broadcast(w.into_bytes()).await.unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, BeamlineError::Protocol(_)));
    }

    #[tokio::test]
    async fn soft_failures_keep_the_loop_alive() {
        let (fabric, ctx, commands) = harness();
        let worker = tokio::spawn(run_worker(
            ctx.clone(),
            CommandRegistry::with_builtin_commands(),
            commands,
        ));

        // module loads are best-effort and must not abort the stream
        let mut w = WriteStream::new();
        w.write_u64(tags::LOAD_MODULE);
        w.write_str("no_such_module").unwrap();
        fabric.broadcast(w.into_bytes()).await.unwrap();

        fabric
            .broadcast(encode_command(&CommandFinalize).unwrap())
            .await
            .unwrap();
        worker.await.unwrap().unwrap();
        assert!(ctx.shutdown_requested());
    }

    #[tokio::test]
    async fn undefined_handle_is_fatal_mid_stream() {
        let (fabric, ctx, commands) = harness();
        let worker = tokio::spawn(run_worker(
            ctx,
            CommandRegistry::with_builtin_commands(),
            commands,
        ));

        let mut w = WriteStream::new();
        w.write_u64(tags::COMMIT_OBJECT);
        w.write_u64(77);
        fabric.broadcast(w.into_bytes()).await.unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.category(), "handle");
    }
}
