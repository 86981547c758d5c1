//! End-to-end cluster scenarios over the in-process fabric.
//!
//! These tests drive the public coordinator API the way an application
//! would and then check the replicated state on both sides of the wire.

use std::sync::Arc;

use beamline::command::{CommandCtx, CommandRegistry};
use beamline::dispatch::{run_worker, ChannelFabric, Coordinator, Fabric, LocalCluster};
use beamline::object::channel;
use beamline::render::ReplySink;
use beamline::wire::WriteStream;
use beamline::{BeamlineError, ClusterConfig, ColorFormat, Handle, ObjectKind, ParamValue, ProtocolError};

type WorkerTask = tokio::task::JoinHandle<beamline::Result<()>>;

/// Spawn worker loops by hand so their contexts stay inspectable after
/// shutdown; `LocalCluster` owns its contexts and never hands them out.
fn spawn_observable_workers(config: &ClusterConfig) -> (Coordinator, Vec<Arc<CommandCtx>>, Vec<WorkerTask>) {
    let (coordinator, links) = Coordinator::new(config).unwrap();
    let worker_count = links.len() as u32;

    let mut contexts = Vec::new();
    let mut tasks = Vec::new();
    for link in links {
        let ctx = Arc::new(CommandCtx::worker(
            link.rank,
            worker_count,
            config,
            link.reply as Arc<dyn ReplySink>,
        ));
        contexts.push(ctx.clone());
        tasks.push(tokio::spawn(run_worker(
            ctx,
            CommandRegistry::with_builtin_commands(),
            link.commands,
        )));
    }
    (coordinator, contexts, tasks)
}

async fn join_workers(tasks: Vec<WorkerTask>) {
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

// Scenario: create, parameterize, and commit a renderer, then confirm the
// committed state is identical on every worker.
#[tokio::test]
async fn committed_parameters_replicate_to_every_worker() {
    let config = ClusterConfig::default().with_workers(3);
    let (coordinator, workers, tasks) = spawn_observable_workers(&config);

    let renderer = coordinator.new_renderer("scivis").await.unwrap();
    coordinator
        .set_param_string(renderer, "aoSamples", "4")
        .await
        .unwrap();
    coordinator
        .set_param(renderer, "pixelSamples", ParamValue::Int(8))
        .await
        .unwrap();
    coordinator.commit(renderer).await.unwrap();

    // finalize flushes the whole stream; afterwards every worker has
    // replayed every command
    coordinator.finalize().await.unwrap();
    join_workers(tasks).await;

    for ctx in &workers {
        let object = ctx.handles().lookup(renderer).unwrap();
        assert_eq!(object.kind(), ObjectKind::Renderer);
        assert_eq!(object.type_name(), "scivis");
        assert!(object.is_committed());
        assert_eq!(
            object.params().committed("aoSamples").unwrap().as_text(),
            Some("4")
        );
        assert_eq!(
            object.params().committed("pixelSamples").unwrap().as_value(),
            Some(&ParamValue::Int(8))
        );
    }
}

// Scenario: release the framebuffer handle while its frame is still in
// flight; the render must finish and assemble regardless.
#[tokio::test]
async fn released_framebuffer_still_assembles_the_frame() {
    let cluster = LocalCluster::start(&ClusterConfig::default().with_workers(2)).unwrap();
    let coordinator = cluster.coordinator();

    let renderer = coordinator.new_renderer("scivis").await.unwrap();
    coordinator.commit(renderer).await.unwrap();
    let camera = coordinator.new_camera("perspective").await.unwrap();
    coordinator.commit(camera).await.unwrap();
    let world = coordinator.new_world().await.unwrap();
    coordinator.commit(world).await.unwrap();

    let framebuffer = coordinator
        .create_framebuffer(64, 64, ColorFormat::Rgba32f, channel::COLOR | channel::ACCUM)
        .await
        .unwrap();

    // keep a direct reference so the assembled pixels stay inspectable
    // after the handle entry is gone
    let mirror = coordinator.context().handles().lookup(framebuffer).unwrap();

    let future = coordinator
        .render_frame(framebuffer, renderer, camera, world)
        .await
        .unwrap();
    coordinator.release(framebuffer).await.unwrap();

    coordinator.wait_render(future).await.unwrap();
    assert_eq!(coordinator.render_progress(future).unwrap(), 1.0);

    assert!(!coordinator.context().handles().defined(framebuffer));
    assert_eq!(mirror.as_framebuffer().unwrap().frames(), 1);

    cluster.shutdown().await.unwrap();
}

// Scenario: pick against an empty world misses everywhere; after
// instancing a group the same pick reports the closest worker hit.
#[tokio::test]
async fn pick_answers_merge_across_the_worker_pool() {
    let cluster = LocalCluster::start(&ClusterConfig::default().with_workers(2)).unwrap();
    let coordinator = cluster.coordinator();

    let renderer = coordinator.new_renderer("scivis").await.unwrap();
    coordinator.commit(renderer).await.unwrap();
    let camera = coordinator.new_camera("perspective").await.unwrap();
    coordinator.commit(camera).await.unwrap();
    let world = coordinator.new_world().await.unwrap();
    coordinator.commit(world).await.unwrap();
    let framebuffer = coordinator
        .create_framebuffer(32, 32, ColorFormat::Rgba8, channel::COLOR)
        .await
        .unwrap();

    let miss = coordinator
        .pick(framebuffer, renderer, camera, world, 0.5, 0.5)
        .await
        .unwrap();
    assert!(miss.is_none());

    let group = coordinator.new_group().await.unwrap();
    let instance = coordinator.new_instance(group).await.unwrap();
    coordinator
        .set_param_object(world, "instance", instance)
        .await
        .unwrap();
    coordinator.commit(world).await.unwrap();

    let hit = coordinator
        .pick(framebuffer, renderer, camera, world, 0.5, 0.5)
        .await
        .unwrap()
        .unwrap();
    assert!((hit.distance - 1.0).abs() < 1e-5, "distance {}", hit.distance);

    cluster.shutdown().await.unwrap();
}

// Scenario: an undecodable frame is a fatal protocol breach on every
// worker that receives it.
#[tokio::test]
async fn a_malformed_frame_aborts_every_worker() {
    let config = ClusterConfig::default().with_workers(2);
    let (fabric, links, _inbox) = ChannelFabric::new(2, &config);

    let mut tasks = Vec::new();
    for link in links {
        let ctx = Arc::new(CommandCtx::worker(
            link.rank,
            2,
            &config,
            link.reply as Arc<dyn ReplySink>,
        ));
        tasks.push(tokio::spawn(run_worker(
            ctx,
            CommandRegistry::with_builtin_commands(),
            link.commands,
        )));
    }

    let mut w = WriteStream::new();
    w.write_u64(4242);
    w.write_u32(0xffff_ffff);
    fabric.broadcast(w.into_bytes()).await.unwrap();
    fabric.close();

    for task in tasks {
        let error = task.await.unwrap().unwrap_err();
        match error {
            BeamlineError::Protocol(ProtocolError::UnknownTag { tag }) => assert_eq!(tag, 4242),
            other => panic!("expected an unknown tag abort, got {other}"),
        }
    }
}

// Scenario: module loading is best-effort; a missing module reports a
// code to the caller and the stream keeps flowing.
#[tokio::test]
async fn module_loads_never_abort_the_stream() {
    let config = ClusterConfig::default().with_workers(2);
    let (coordinator, workers, tasks) = spawn_observable_workers(&config);

    assert_eq!(coordinator.load_module("denoiser").await.unwrap(), 0);
    let denoiser = coordinator
        .new_object(ObjectKind::ImageOperation, "denoiser")
        .await
        .unwrap();
    assert_ne!(denoiser, Handle::NULL);

    let code = coordinator.load_module("no_such_module").await.unwrap();
    assert_ne!(code, 0);

    // the stream is still healthy after the failed load
    let renderer = coordinator.new_renderer("pathtracer").await.unwrap();
    coordinator.commit(renderer).await.unwrap();

    coordinator.finalize().await.unwrap();
    join_workers(tasks).await;

    for ctx in &workers {
        assert!(ctx.modules().is_loaded("denoiser"));
        assert!(!ctx.modules().is_loaded("no_such_module"));
        assert!(ctx.handles().defined(denoiser));
        assert!(ctx.handles().lookup(renderer).unwrap().is_committed());
    }
}

// Scenario: accumulation continues across frames and restarts after an
// explicit reset, on the mirror exactly as on the workers.
#[tokio::test]
async fn accumulation_counts_frames_until_reset() {
    let config = ClusterConfig::default().with_workers(2);
    let (coordinator, workers, tasks) = spawn_observable_workers(&config);

    let renderer = coordinator.new_renderer("scivis").await.unwrap();
    coordinator.commit(renderer).await.unwrap();
    let camera = coordinator.new_camera("perspective").await.unwrap();
    coordinator.commit(camera).await.unwrap();
    let world = coordinator.new_world().await.unwrap();
    coordinator.commit(world).await.unwrap();
    let framebuffer = coordinator
        .create_framebuffer(64, 32, ColorFormat::Rgba32f, channel::COLOR | channel::ACCUM)
        .await
        .unwrap();
    let mirror = coordinator.context().handles().lookup(framebuffer).unwrap();

    for expected in 1..=2u32 {
        let future = coordinator
            .render_frame(framebuffer, renderer, camera, world)
            .await
            .unwrap();
        coordinator.wait_render(future).await.unwrap();
        coordinator.release(future).await.unwrap();
        assert_eq!(mirror.as_framebuffer().unwrap().frames(), expected);
    }

    coordinator.reset_accumulation(framebuffer).await.unwrap();
    assert_eq!(mirror.as_framebuffer().unwrap().frames(), 0);

    let future = coordinator
        .render_frame(framebuffer, renderer, camera, world)
        .await
        .unwrap();
    coordinator.wait_render(future).await.unwrap();
    assert_eq!(mirror.as_framebuffer().unwrap().frames(), 1);

    coordinator.finalize().await.unwrap();
    join_workers(tasks).await;

    for ctx in &workers {
        let local = ctx.handles().lookup(framebuffer).unwrap();
        assert_eq!(local.as_framebuffer().unwrap().frames(), 1);
    }
}

// Scenario: switching the load balancer mid-session affects later frames
// on every process without disturbing in-flight state.
#[tokio::test]
async fn scheduling_policy_switches_apply_everywhere() {
    let config = ClusterConfig::default().with_workers(2);
    let (coordinator, workers, tasks) = spawn_observable_workers(&config);

    let renderer = coordinator.new_renderer("scivis").await.unwrap();
    coordinator.commit(renderer).await.unwrap();
    let camera = coordinator.new_camera("perspective").await.unwrap();
    coordinator.commit(camera).await.unwrap();
    let world = coordinator.new_world().await.unwrap();
    coordinator.commit(world).await.unwrap();
    let framebuffer = coordinator
        .create_framebuffer(128, 64, ColorFormat::Rgba32f, channel::COLOR | channel::ACCUM)
        .await
        .unwrap();

    coordinator.set_load_balancer(false, 1).await.unwrap();
    let first = coordinator
        .render_frame(framebuffer, renderer, camera, world)
        .await
        .unwrap();
    coordinator.wait_render(first).await.unwrap();

    coordinator.set_load_balancer(true, 4).await.unwrap();
    let second = coordinator
        .render_frame(framebuffer, renderer, camera, world)
        .await
        .unwrap();
    coordinator.wait_render(second).await.unwrap();

    let mirror = coordinator.context().handles().lookup(framebuffer).unwrap();
    assert_eq!(mirror.as_framebuffer().unwrap().frames(), 2);

    coordinator.finalize().await.unwrap();
    join_workers(tasks).await;

    for ctx in &workers {
        let policy = ctx.scheduler().policy();
        assert!(policy.dynamic);
        assert_eq!(policy.prealloc_tiles, 4);
    }
}
