use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use learning_orchestrator::config::{OrchestratorConfig, parse_worker_pool};
use learning_orchestrator::orchestrator::{self, Orchestrator};
use learning_orchestrator::store::InMemoryTaskStore;

/// How often the daemon logs a health summary.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs flush on exit
    let _log_guard = init_tracing();

    let config = OrchestratorConfig::from_env();
    config.validate().context("invalid configuration")?;

    eprintln!("Learning orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Scheduler tick: {:?}, worker timeout: {:?}",
        config.scheduler.tick_interval, config.scheduler.worker_timeout
    );
    eprintln!(
        "   Monitor tick: {:?}, stale after: {:?}",
        config.tracker.monitor_interval, config.tracker.stale_threshold
    );

    let scheduler_interval = config.scheduler.tick_interval;
    let monitor_interval = config.tracker.monitor_interval;

    let orchestrator =
        Arc::new(Orchestrator::new(config).with_store(Arc::new(InMemoryTaskStore::new())));

    // ── Static worker pool ───────────────────────────────────────────────
    let pool = std::env::var("LEARNQ_WORKERS").unwrap_or_default();
    let workers = parse_worker_pool(&pool).context("failed to parse LEARNQ_WORKERS")?;
    for worker in workers {
        orchestrator
            .register_worker(worker.worker_id.clone(), worker.capacity, worker.capabilities)
            .await
            .with_context(|| format!("failed to register worker {}", worker.worker_id))?;
    }

    // ── Background loops ─────────────────────────────────────────────────
    let scheduler_handle =
        orchestrator::spawn_scheduler_loop(Arc::clone(&orchestrator), scheduler_interval);
    let monitor_handle =
        orchestrator::spawn_monitor_loop(Arc::clone(&orchestrator), monitor_interval);

    let health_orchestrator = Arc::clone(&orchestrator);
    let health_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
        loop {
            ticker.tick().await;
            let report = health_orchestrator.health_check().await;
            let stats = health_orchestrator.scheduler().stats().await;
            tracing::info!(
                status = ?report.status,
                queued = stats.queued,
                running = stats.running + stats.assigned,
                workers = stats.workers_total,
                "Health"
            );
        }
    });

    tracing::info!("Orchestrator running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    scheduler_handle.abort();
    monitor_handle.abort();
    health_handle.abort();

    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file under `LEARNQ_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match std::env::var("LEARNQ_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "learning-orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
