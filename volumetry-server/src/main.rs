//! # Volumetry Server
//!
//! Observes a container host, keeps an inventory of its storage volumes,
//! measures their sizes on a schedule, and serves the results over REST and
//! WebSocket.
//!
//! Startup is staged so operators can tell failure classes apart by exit
//! code: 1 configuration, 2 persistence unreachable, 3 host oracle
//! unreachable.

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod ws;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volumetry_config::Settings;
use volumetry_core::methods::builtin_sizers;
use volumetry_core::{
    engine::EngineConfig, reconciler::ReconcilerConfig, scheduler::SchedulerConfig,
    store, EventBus, Metrics, Reconciler, ScanCache, ScanEngine, Scheduler, VolumeOracle,
};

use crate::routes::create_router;
use crate::state::AppState;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Command line arguments for the volumetry server.
#[derive(Parser, Debug)]
#[command(name = "volumetry-server")]
#[command(about = "Container volume inventory and size monitoring service")]
struct Args {
    /// Bind host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Path to the TOML configuration file
    #[arg(long, env = "VOLUMETRY_CONFIG_PATH")]
    config: Option<std::path::PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "volumetry_server=info,volumetry_core=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    if let Some(path) = &args.config {
        std::env::set_var("VOLUMETRY_CONFIG_PATH", path);
    }

    let (mut settings, source) = match Settings::load() {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(1);
        }
    };
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    info!(?source, "configuration loaded");

    match run(settings).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<ExitCode> {
    let settings = Arc::new(settings);

    let metrics = Arc::new(Metrics::new().map_err(|err| anyhow::anyhow!(err.to_string()))?);

    // stage: persistence
    let store = match store::connect(
        &settings.persistence.dsn,
        settings.persistence.max_conns,
        Duration::from_secs(settings.persistence.timeout_secs),
        settings.system_regex(),
    )
    .await
    {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, dsn = %settings.persistence.dsn, "persistence unreachable");
            return Ok(ExitCode::from(2));
        }
    };
    let requeued = store.cancel_stale_scan_runs().await.unwrap_or(0);
    if requeued > 0 {
        info!(requeued, "canceled scan runs interrupted by the previous shutdown");
    }

    // stage: host oracle
    let oracle: Arc<dyn VolumeOracle> = Arc::new(
        volumetry_core::oracle::DockerOracle::new(
            &settings.oracle.endpoint,
            Duration::from_secs(settings.oracle.timeout_secs),
        )
        .map_err(|err| anyhow::anyhow!(err.to_string()))?,
    );
    if let Err(err) = oracle.ping().await {
        error!(error = %err, endpoint = %settings.oracle.endpoint, "host oracle unreachable");
        return Ok(ExitCode::from(3));
    }

    // process singletons
    let cache = Arc::new(ScanCache::new(settings.cache_ttl(), settings.cache.max_size));
    let bus = Arc::new(EventBus::default());

    let engine = match ScanEngine::new(
        Arc::clone(&store),
        Arc::clone(&oracle),
        Arc::clone(&cache),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        builtin_sizers(),
        EngineConfig::from_settings(&settings),
    )
    .await
    {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "no scan method available");
            return Ok(ExitCode::from(1));
        }
    };

    let scheduler = Scheduler::new(
        Arc::clone(&engine),
        Arc::clone(&store),
        Arc::clone(&metrics),
        SchedulerConfig::from_settings(&settings),
    );
    let reconciler = Reconciler::new(
        Arc::clone(&oracle),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        ReconcilerConfig::from_settings(&settings),
    );

    reconciler.start().await;
    scheduler.start().await;

    let state = AppState::new(
        Arc::clone(&settings),
        store,
        oracle,
        cache,
        Arc::clone(&engine),
        Arc::clone(&scheduler),
        Arc::clone(&reconciler),
        bus,
        metrics,
    );
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid bind address: {err}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "volumetry server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    engine.shutdown();
    scheduler.stop(SHUTDOWN_DEADLINE).await;
    reconciler.stop().await;

    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}
