use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use civicscan_api::{routes, AppState};
use civicscan_common::Config;
use civicscan_orchestrator::{
    connect_queue, BrokerClient, BrokerWorker, HttpResearcher, JobLifecycleManager, Orchestrator,
    QueueBackend, ScheduleEngine,
};
use civicscan_store::PgResearchStore;

const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "civicscan", about = "Civic program research orchestrator")]
struct Cli {
    /// `serve` runs the HTTP API and scheduler; `worker` claims jobs from the broker
    #[arg(long, value_enum, default_value_t = Role::Serve, env = "CIVICSCAN_ROLE")]
    role: Role,

    /// Do not run the schedule poller in this process
    #[arg(long)]
    no_scheduler: bool,

    /// Also run a broker worker inside the API process (broker backend only)
    #[arg(long)]
    with_worker: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    Serve,
    Worker,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("civicscan=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    info!(role = ?cli.role, "Starting civicscan");

    let config = Config::from_env()?;
    config.log_redacted();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let store = Arc::new(PgResearchStore::new(pool));
    store.migrate().await?;
    info!("Migrations complete");

    let researcher = Arc::new(HttpResearcher::new(
        config.research_service_url.clone(),
        config.research_timeout,
    )?);
    let lifecycle = Arc::new(JobLifecycleManager::new(
        store.clone(),
        researcher,
        config.research_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_on_ctrl_c(shutdown_tx));

    match cli.role {
        Role::Worker => run_worker(&config, lifecycle, shutdown_rx).await,
        Role::Serve => serve(&cli, &config, store, lifecycle, shutdown_rx).await,
    }
}

async fn serve(
    cli: &Cli,
    config: &Config,
    store: Arc<PgResearchStore>,
    lifecycle: Arc<JobLifecycleManager>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let queue = connect_queue(config, store.clone(), lifecycle.clone()).await;
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        queue.clone(),
        config.overlap_policy,
        config.max_jurisdictions_per_submission,
    ));
    let schedules = Arc::new(ScheduleEngine::new(
        store,
        orchestrator.clone(),
        config.schedule_poll_interval,
        config.max_jurisdictions_per_submission,
    ));

    let mut background = Vec::new();

    if cli.no_scheduler {
        info!("Schedule poller disabled");
    } else {
        let engine = schedules.clone();
        let rx = shutdown.clone();
        background.push(tokio::spawn(async move { engine.run(rx).await }));
    }

    if cli.with_worker {
        match (queue.backend(), config.broker_url.as_deref()) {
            (QueueBackend::Broker, Some(url)) => {
                let client = BrokerClient::new(url, &config.broker_queue)?;
                let worker = BrokerWorker::new(
                    client,
                    lifecycle,
                    config.worker_concurrency,
                    WORKER_POLL_INTERVAL,
                );
                let rx = shutdown.clone();
                background.push(tokio::spawn(async move { worker.run(rx).await }));
            }
            _ => warn!("--with-worker ignored: jobs already run in-process on the store queue"),
        }
    }

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        schedules,
    });
    let app = routes::build_router(state);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(backend = queue.backend().as_str(), "civicscan API listening on http://{addr}");

    let mut signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal.wait_for(|stop| *stop).await;
        })
        .await?;

    orchestrator.shutdown().await;
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn run_worker(
    config: &Config,
    lifecycle: Arc<JobLifecycleManager>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let url = config
        .broker_url
        .as_deref()
        .context("--role worker requires BROKER_URL")?;
    let client = BrokerClient::new(url, &config.broker_queue)?;
    client
        .health(config.broker_probe_timeout)
        .await
        .context("Broker is unreachable")?;

    BrokerWorker::new(
        client,
        lifecycle,
        config.worker_concurrency,
        WORKER_POLL_INTERVAL,
    )
    .run(shutdown)
    .await;
    Ok(())
}

async fn shutdown_on_ctrl_c(tx: watch::Sender<bool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            // Keep the sender alive so receivers don't read a dropped channel as shutdown.
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
    let _ = tx.send(true);
}
