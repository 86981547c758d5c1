//! Offline rendering demo: start an in-process cluster, build a small
//! scene, refine it over a few accumulation frames, then query a pick.
//!
//! Run with: cargo run --example offline_render

use beamline::{channel, ClusterConfig, ColorFormat, LocalCluster};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = ClusterConfig::default().with_workers(4);
    let cluster = LocalCluster::start(&config)?;
    let coordinator = cluster.coordinator();
    println!("cluster up, session {}", coordinator.session());

    // scene: a renderer, a camera, and one instanced group
    let renderer = coordinator.new_renderer("scivis").await?;
    coordinator.set_param_string(renderer, "aoSamples", "4").await?;
    coordinator.commit(renderer).await?;

    let camera = coordinator.new_camera("perspective").await?;
    coordinator.commit(camera).await?;

    let group = coordinator.new_group().await?;
    let instance = coordinator.new_instance(group).await?;
    let world = coordinator.new_world().await?;
    coordinator.set_param_object(world, "instance", instance).await?;
    coordinator.commit(world).await?;

    let framebuffer = coordinator
        .create_framebuffer(512, 256, ColorFormat::Rgba32f, channel::COLOR | channel::ACCUM)
        .await?;

    for frame in 1..=4 {
        let future = coordinator
            .render_frame(framebuffer, renderer, camera, world)
            .await?;
        coordinator.wait_render(future).await?;
        coordinator.release(future).await?;
        println!("frame {frame} assembled");
    }

    match coordinator.pick(framebuffer, renderer, camera, world, 0.5, 0.5).await? {
        Some(hit) => println!(
            "pick at center hit {:?} at distance {:.3}",
            hit.world_position, hit.distance
        ),
        None => println!("pick at center found nothing"),
    }

    cluster.shutdown().await?;
    println!("cluster down");
    Ok(())
}
