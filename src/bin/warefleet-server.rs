//! Warefleet controller server
//!
//! Boots the coordination engine: loads configuration and the floor map,
//! wires the stores and the event bus, spawns every supervised loop and
//! serves the REST surface until ctrl-c.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warefleet::amr::AmrExecutor;
use warefleet::api::{ApiContext, RestApiServer};
use warefleet::concurrency::CancelToken;
use warefleet::config::{AppConfig, ConfigLoader};
use warefleet::conflict::deadlock::DeadlockDetector;
use warefleet::conflict::ConflictResolver;
use warefleet::dispatch::publisher::MissionPublisher;
use warefleet::dispatch::ShuttleDispatcher;
use warefleet::events::EventBus;
use warefleet::graph::{JsonMapCatalog, MapCatalog};
use warefleet::lifter::plc::{InMemoryPlc, PlcClient};
use warefleet::lifter::LifterCoordinator;
use warefleet::mission::MissionCoordinator;
use warefleet::row::RowCoordinator;
use warefleet::scheduler::StagingScheduler;
use warefleet::state::VehicleStateCache;
use warefleet::store::occupancy::OccupancyStore;
use warefleet::store::path_cache::PathCache;
use warefleet::store::reservation::ReservationStore;
use warefleet::store::task_queue::{ShuttleTaskQueue, StagingQueue};

#[derive(Parser)]
#[command(name = "warefleet-server")]
#[command(about = "Warehouse fleet controller: shuttle/AMR/lifter coordination")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); defaults plus WCS_* env overrides when
    /// omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Floor map catalog (JSON)
    #[arg(long, default_value = "./map.json")]
    map: PathBuf,

    /// Listen address override
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg: AppConfig = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::load_from_env().context("loading configuration")?,
    };
    if let Some(listen) = cli.listen {
        cfg.service.listen_addr = listen;
    }

    init_tracing(&cfg);
    info!(service = %cfg.service.name, "starting");

    // Map load failure is fatal.
    let catalog = JsonMapCatalog::new(&cli.map);
    let map = Arc::new(
        catalog
            .load()
            .await
            .with_context(|| format!("loading map {}", cli.map.display()))?,
    );
    info!(floors = ?map.floor_ids(), "map loaded");

    let token = CancelToken::new();
    let (bus, ingress_rx) = EventBus::new(cfg.service.ingress_queue_capacity);

    // Stores.
    let occupancy = Arc::new(OccupancyStore::new(Duration::from_secs(
        cfg.timing.occupation_lease_secs,
    )));
    let reservations = Arc::new(ReservationStore::new());
    let path_cache = Arc::new(PathCache::new(Duration::from_secs(cfg.timing.path_ttl_secs)));
    let staging = Arc::new(StagingQueue::new());
    let tasks = Arc::new(ShuttleTaskQueue::new());
    let rows = Arc::new(RowCoordinator::new(
        Duration::from_secs(cfg.timing.row_lock_idle_secs),
        Duration::from_secs(cfg.timing.row_lock_stale_secs),
        Duration::from_secs(cfg.timing.batch_row_ttl_secs),
    ));
    let state = Arc::new(VehicleStateCache::new());

    // Lifter over the PLC seam. The in-memory PLC stands in for the S7
    // transport, which lives outside this crate.
    let tower = cfg
        .lifter
        .primary()
        .context("no lifter tower configured")?
        .clone();
    let plc: Arc<dyn PlcClient> = Arc::new(InMemoryPlc::new(
        &tower.id,
        tower.floors.iter().map(|f| f.floor).collect(),
        tower.floors.first().map(|f| f.floor).unwrap_or(1),
    ));
    let lifter = Arc::new(LifterCoordinator::new(
        tower,
        plc,
        bus.clone(),
        Duration::from_secs(cfg.lifter.busy_ttl_secs),
        Duration::from_secs(cfg.service.external_call_timeout_secs),
    ));

    // Coordination layers.
    let mission = Arc::new(MissionCoordinator::new(
        Arc::clone(&map),
        Arc::clone(&occupancy),
        Arc::clone(&path_cache),
        Arc::clone(&rows),
        Arc::clone(&lifter),
        Arc::clone(&state),
        cfg.traffic.clone(),
    ));
    let conflict = Arc::new(ConflictResolver::new(
        Arc::clone(&map),
        Arc::clone(&occupancy),
        Arc::clone(&reservations),
        Arc::clone(&path_cache),
        Arc::clone(&rows),
        Arc::clone(&state),
        Arc::clone(&tasks),
        bus.clone(),
        cfg.conflict.clone(),
        cfg.traffic.clone(),
    ));
    let publisher = Arc::new(MissionPublisher::new(
        bus.clone(),
        Duration::from_millis(cfg.timing.publish_retry_interval_ms),
        Duration::from_secs(cfg.timing.publish_ack_timeout_secs),
    ));
    let dispatcher = ShuttleDispatcher::new(
        Arc::clone(&map),
        Arc::clone(&state),
        Arc::clone(&tasks),
        Arc::clone(&mission),
        Arc::clone(&publisher),
        Arc::clone(&occupancy),
        Arc::clone(&reservations),
        Arc::clone(&path_cache),
        Arc::clone(&conflict),
        Arc::clone(&lifter),
        bus.clone(),
        &cfg.timing,
    );
    let scheduler = Arc::new(StagingScheduler::new(
        Arc::clone(&map),
        Arc::clone(&staging),
        Arc::clone(&tasks),
        Arc::clone(&reservations),
        Arc::clone(&rows),
        Arc::clone(&state),
        &cfg.timing,
    ));
    let detector = Arc::new(DeadlockDetector::new(
        Arc::clone(&state),
        Arc::clone(&path_cache),
        Arc::clone(&occupancy),
        Arc::clone(&reservations),
        Arc::clone(&tasks),
        bus.clone(),
    ));
    let amr_executor = Arc::new(AmrExecutor::new(Arc::clone(&map), &cfg.amr));

    // Supervised loops. Schedules all come from TimingConfig.
    Arc::clone(&dispatcher).spawn_router(ingress_rx, token.clone());
    Arc::clone(&dispatcher).spawn_dispatch_loop(
        Duration::from_secs(cfg.timing.dispatch_tick_secs),
        token.clone(),
    );
    Arc::clone(&scheduler).spawn(
        Duration::from_secs(cfg.timing.staging_tick_secs),
        token.clone(),
    );
    Arc::clone(&lifter).spawn_processor(
        Duration::from_millis(cfg.timing.lifter_tick_ms),
        token.clone(),
    );
    Arc::clone(&path_cache).spawn_cleaner(
        Duration::from_secs(cfg.timing.path_cleaner_interval_secs),
        token.clone(),
    );
    Arc::clone(&rows).spawn_sweeper(
        Duration::from_secs(cfg.timing.row_sweeper_interval_secs),
        token.clone(),
    );
    Arc::clone(&detector).spawn(
        Duration::from_secs(cfg.timing.deadlock_interval_secs),
        token.clone(),
    );

    // REST surface.
    let api = RestApiServer::new(Arc::new(ApiContext {
        service_name: cfg.service.name.clone(),
        map: Arc::clone(&map),
        amr_executor,
        state: Arc::clone(&state),
        lifter: Arc::clone(&lifter),
        staging: Arc::clone(&staging),
        tasks: Arc::clone(&tasks),
    }));
    let listener = tokio::net::TcpListener::bind(&cfg.service.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.service.listen_addr))?;
    info!(addr = %cfg.service.listen_addr, "serving");

    let shutdown = token.clone();
    let server = axum::serve(listener, api.router()).with_graceful_shutdown(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "ctrl-c handler failed");
                }
                info!("shutdown requested");
                shutdown.cancel();
            }
        }
    });
    server.await.context("http server")?;

    token.cancel();
    info!("stopped");
    Ok(())
}

fn init_tracing(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
