use hookflow::api;
use hookflow::config;
use hookflow::db;
use hookflow::webhooks::{Engine, EventPublisher};

use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hookflow=debug"));

    let json = std::env::var("HOOKFLOW_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    init_tracing();

    let delivery = cfg.delivery();
    let api_addr = cfg.admin_addr.clone();

    tracing::info!(
        worker_id = %cfg.worker_id,
        api = %api_addr.as_deref().unwrap_or("disabled"),
        poll_interval_ms = cfg.poll_interval_ms,
        reap_interval_ms = cfg.reap_interval_ms,
        claim_batch_size = cfg.claim_batch_size,
        max_concurrent_deliveries = cfg.max_concurrent_deliveries,
        request_timeout_secs = cfg.request_timeout_secs,
        failure_threshold = cfg.failure_threshold,
        allow_insecure_urls = cfg.allow_insecure_urls,
        migrate_on_startup = cfg.migrate_on_startup,
        "hookflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
        tracing::info!("migrations applied");
    }

    let publish_queue_capacity = delivery.publish_queue_capacity;
    let engine = Engine::new(pool, delivery)?;
    let (publisher, publisher_handle) =
        EventPublisher::spawn(engine.fanout.clone(), publish_queue_capacity);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- API task ----
    let app = api::router(api::ApiState {
        engine: engine.clone(),
        publisher: publisher.clone(),
        stats_window_days: cfg.stats_window_days,
    });

    let api_handle = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Some(addr) = api_addr {
                let listener = tokio::net::TcpListener::bind(&addr).await?;
                tracing::info!(%addr, "admin api listening");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await?;
            } else {
                let _ = shutdown.changed().await;
            }
            Ok::<(), anyhow::Error>(())
        })
    };

    // ---- Retry worker task ----
    let worker_handle = {
        let worker = engine.retry_worker.clone();
        let poll_interval = Duration::from_millis(cfg.poll_interval_ms);
        let reap_interval = Duration::from_millis(cfg.reap_interval_ms);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(poll_interval, reap_interval, shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // Dropping the last sender lets the publisher finish queued fan-outs and exit.
    drop(publisher);

    worker_handle.await?;
    api_handle.await??;

    let drain_for = Duration::from_secs(cfg.request_timeout_secs + 10);
    match tokio::time::timeout(drain_for, publisher_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "event publisher task failed"),
        Err(_) => tracing::warn!(
            drain_secs = drain_for.as_secs(),
            "event publisher did not drain in time; queued events were not delivered"
        ),
    }

    tracing::info!("hookflow worker stopped");
    Ok(())
}
