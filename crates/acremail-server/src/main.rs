//! acremail - email delivery and automation entry point

use acremail_api::AppState;
use acremail_common::config::{Config, LoggingConfig};
use acremail_core::queue::{EmailJobExecutor, JobQueue, QueueSettings};
use acremail_core::tokens::{TrackingUrls, UnsubscribeSigner};
use acremail_core::transport::SendGridConfig;
use acremail_core::{
    AutomationEngine, CampaignManager, DeliveryConfig, DeliveryEngine, EmailTransport,
    LogTransport, Metrics, Scheduler, SendGridTransport, TrackingService,
};
use acremail_storage::{DatabasePool, MemoryStore, Repositories};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    info!("Starting acremail...");
    config.validate()?;

    // Fall back to in-memory persistence when no database is configured
    let (repos, db_pool) = match config.database.url {
        Some(_) => {
            let pool = DatabasePool::new(&config.database).await?;
            pool.migrate().await?;
            (Repositories::postgres(&pool), Some(pool))
        }
        None => {
            warn!("database.url not set, using in-memory storage; nothing will persist");
            (Repositories::in_memory(Arc::new(MemoryStore::new())), None)
        }
    };

    let metrics = Metrics::new().context("Failed to register metrics")?;
    let secret = config
        .tracking
        .unsubscribe_secret
        .clone()
        .context("tracking.unsubscribe_secret must be set")?;
    let signer = UnsubscribeSigner::new(secret);

    let transport: Arc<dyn EmailTransport> = match config.email.provider.as_str() {
        "sendgrid" => {
            let sendgrid = SendGridConfig::from_email_config(&config.email)
                .context("email.sendgrid_api_key is required for the sendgrid provider")?;
            Arc::new(SendGridTransport::new(sendgrid)?)
        }
        _ => {
            warn!("Using the log transport; emails are recorded, not delivered");
            Arc::new(LogTransport::new())
        }
    };
    info!(provider = transport.name(), "Email transport ready");

    let delivery = Arc::new(
        DeliveryEngine::new(
            transport,
            repos.tracking.clone(),
            signer.clone(),
            TrackingUrls::new(config.tracking.base_url.clone()),
            DeliveryConfig::from(&config.email),
        )
        .with_metrics(metrics.clone()),
    );

    let executor = Arc::new(
        EmailJobExecutor::new(&repos, delivery.clone())
            .with_batching(config.queue.batch_size, config.queue.batch_delay()),
    );
    let queue = JobQueue::new(
        repos.jobs.clone(),
        executor,
        QueueSettings::from(&config.queue),
    )
    .with_metrics(metrics.clone());

    let automation = Arc::new(
        AutomationEngine::new(
            &repos,
            queue.clone(),
            delivery.clone(),
            config.tracking.frontend_url.clone(),
        )
        .with_support_email(config.email.support_email.clone()),
    );

    let campaigns = Arc::new(CampaignManager::new(&repos, queue.clone(), delivery.clone()));
    let tracking = Arc::new(
        TrackingService::new(&repos, signer, &config.tracking).with_metrics(metrics.clone()),
    );

    // Queue worker
    let shutdown = CancellationToken::new();
    let queue_handle = queue.start(shutdown.clone());
    info!("Job queue worker started");

    // Recurring tasks
    let scheduler = if config.scheduler.enabled {
        let scheduler = Arc::new(Scheduler::new(
            &repos,
            queue.clone(),
            automation.clone(),
            config.scheduler.clone(),
        ));
        Some(scheduler.start().await?)
    } else {
        info!("Scheduler disabled");
        None
    };

    // API server
    let mut state = AppState::new(tracking, campaigns, metrics);
    if let Some(pool) = db_pool {
        state = state.with_db_pool(pool);
    }
    let app = acremail_api::create_router(state, &config.api.cors_origins);
    let addr = format!("{}:{}", config.server.bind_address, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", addr))?;
    info!("Starting API server on {}", addr);

    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await
        {
            error!("API server error: {}", e);
        }
    });

    info!("acremail started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.shutdown().await {
            warn!("Scheduler shutdown failed: {}", e);
        }
    }
    if let Err(e) = queue_handle.await {
        warn!("Queue worker ended abnormally: {}", e);
    }
    if let Err(e) = api_handle.await {
        warn!("API server ended abnormally: {}", e);
    }

    info!("acremail shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
