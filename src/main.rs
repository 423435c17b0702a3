use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use swev::config::load_server_config;
use swev::content::{ContentKind, ContentRegistry};
use swev::scripting::{LogHost, ScriptHost};
use swev::telemetry::init_logging;
use swev::testgen::generate_test_world;
use swev::world::{FileRegionSource, WorldStore};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = load_server_config();
    init_logging(&config.log_filter);

    if let Some(pos) = args.iter().position(|a| a == "--generate-test-world") {
        let dir = args
            .get(pos + 1)
            .filter(|a| !a.starts_with("--"))
            .map(PathBuf::from)
            .unwrap_or_else(|| config.data_dir.clone());
        let generated = generate_test_world(&dir)
            .with_context(|| format!("generating test world in {}", dir.display()))?;
        println!(
            "[server] Test world generation complete ({} files in {})",
            generated.files.len(),
            dir.display()
        );
        return Ok(());
    }

    if let Err(e) = run(config).await {
        error!("[server] Fatal: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run(config: swev::config::ServerConfig) -> anyhow::Result<()> {
    info!("[server] Starting with data dir {}", config.data_dir.display());

    let world = WorldStore::new(Arc::new(FileRegionSource::new(&config.data_dir)));
    let info = world.load_world().await.context("loading world metadata")?;
    let spawn_regions = world.load_neighborhood(info.spawn).await;
    info!(
        "[server] Spawn neighborhood ready ({} of {} regions available)",
        spawn_regions.iter().filter(|(_, r)| r.is_some()).count(),
        spawn_regions.len()
    );

    let host = Rc::new(ScriptHost::new(Rc::new(LogHost), config.script_limits()));
    let mut npcs = ContentRegistry::new(
        ContentKind::Npc,
        host.clone(),
        &config.data_dir,
        config.duplicate_policy,
    );
    npcs.load_all().await.context("loading npc index")?;
    let mut global_events = ContentRegistry::new(
        ContentKind::GlobalEvent,
        host.clone(),
        &config.data_dir,
        config.duplicate_policy,
    );
    global_events
        .load_all()
        .await
        .context("loading global event index")?;

    let started = global_events.dispatch("startup", "onStartup");
    info!("[server] Ran {started} startup events; press Ctrl-C to stop");

    tokio::select! {
        _ = host.run_timers() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("[server] Could not listen for Ctrl-C: {e}");
            }
        }
    }

    info!("[server] Shutting down");
    global_events.dispatch("shutdown", "onShutdown");
    host.shutdown();
    global_events.cleanup();
    npcs.cleanup();
    world.cleanup();

    let stats = host.stats();
    info!(
        "[server] Script states closed {}/{}, pins released {}/{}",
        stats.instances_closed, stats.instances_created, stats.pins_released, stats.pins_created
    );
    Ok(())
}
