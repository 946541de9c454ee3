//! Ingestion worker — entry point.
//!
//! Loads configuration, initializes the governor, job store, and upstream
//! client, then runs the scheduler tick and N worker loops until SIGINT or
//! SIGTERM.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use hl_ingest::config::Config;
use hl_ingest::db::pool;
use hl_ingest::governor::Governor;
use hl_ingest::handlers::ingest::IngestWalletHandler;
use hl_ingest::handlers::rollup::{RollupGlobalDayHandler, RollupWalletDayHandler};
use hl_ingest::jobs::payload::JobKind;
use hl_ingest::jobs::store::JobStore;
use hl_ingest::jobs::worker::{HandlerMap, JobHandler, Worker};
use hl_ingest::logging;
use hl_ingest::scheduler::Scheduler;
use hl_ingest::upstream::{FillsSource, HyperliquidClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    logging::structured::init_logging(&config.logging);

    let org_id = config.org_uuid()?;
    let worker_id = config.worker_id();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        org_id = %org_id,
        worker_id = %worker_id,
        distributed_governor = config.governor.distributed,
        "hl-ingest starting"
    );

    let db_pool = pool::create_pool(&config.database.url).await?;
    pool::run_migrations(&db_pool).await?;
    info!("database connected and migrations applied");

    let governor = Arc::new(Governor::new(db_pool.clone(), config.governor.clone()));
    let store = JobStore::new(db_pool.clone());

    // Belt-and-braces: requeue anything a crashed worker left behind.
    let recovered = store.recover_stuck(org_id).await?;
    if recovered > 0 {
        warn!(recovered, "recovered jobs with expired leases at startup");
    }

    let source: Arc<dyn FillsSource> = Arc::new(HyperliquidClient::new(&config.upstream)?);

    let mut handlers: HandlerMap = HashMap::new();
    handlers.insert(
        JobKind::IngestWallet,
        Arc::new(IngestWalletHandler::new(
            db_pool.clone(),
            store.clone(),
            governor.clone(),
            source,
        )) as Arc<dyn JobHandler>,
    );
    handlers.insert(
        JobKind::RollupWalletDay,
        Arc::new(RollupWalletDayHandler::new(db_pool.clone(), store.clone())),
    );
    handlers.insert(
        JobKind::RollupGlobalDay,
        Arc::new(RollupGlobalDayHandler::new(db_pool.clone())),
    );
    let handlers = Arc::new(handlers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Scheduler tick
    let sched = Scheduler::new(
        db_pool.clone(),
        store.clone(),
        governor.clone(),
        org_id,
        config.scheduler.clone(),
    );
    let sched_shutdown = shutdown_rx.clone();
    let _scheduler_handle = tokio::spawn(async move {
        sched.run(sched_shutdown).await;
    });

    // Worker loops
    let mut worker_handles = Vec::new();
    for n in 0..config.worker.concurrency {
        let worker = Worker::new(
            store.clone(),
            org_id,
            format!("{worker_id}-{n}"),
            handlers.clone(),
            &config.worker,
            shutdown_rx.clone(),
        );
        worker_handles.push(tokio::spawn(worker.run()));
    }

    info!(
        workers = config.worker.concurrency,
        "all subsystems started, waiting for shutdown signal"
    );

    // Wait for shutdown signal
    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => { info!("received SIGINT"); }
            _ = sigterm.recv() => { info!("received SIGTERM"); }
        }
    };

    shutdown.await;

    // Stop claiming new jobs; in-flight jobs finish or are reclaimed after
    // their lease expires.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("shutdown complete");
    Ok(())
}
