//! Backup Keeper - Main Entry Point

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use backup_keeper_backend::{
    api,
    config::Config,
    db,
    error::Result,
    services::{
        alert_service::AlertService,
        backup_service::BackupService,
        command_registry::CommandRegistry,
        health_monitor_service::BackupMonitor,
        metrics_service,
        notification_service::NotificationService,
        producer::{DatabaseProducer, FileProducer, PathFilter, PgDumper},
        recovery_service::RecoveryController,
        report_service::ReportService,
        scheduler_service::BackupScheduler,
        storage_service::StorageService,
    },
    store::{MetadataStore, PgStore},
    telemetry,
};

/// How often the scheduler looks for due occurrences and retries.
const SCHEDULER_TICK: Duration = Duration::from_secs(15);
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const POOL_GAUGE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing before configuration so config errors are logged
    let otel_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let _otel_guard = telemetry::init_tracing(otel_endpoint.as_deref(), "backup-keeper")?;

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting Backup Keeper");

    // Connect to database
    let db_pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db_pool).await?;
    tracing::info!("Database migrations complete");

    let metrics_handle = metrics_service::init_metrics()?;
    tracing::info!("Prometheus metrics recorder initialized");

    let store: Arc<dyn MetadataStore> = Arc::new(PgStore::new(db_pool.clone()));
    let storage = Arc::new(StorageService::from_config(&config.storage).await?);

    // Producers
    let dumper = Arc::new(PgDumper::new(
        db_pool.clone(),
        config.database_url.clone(),
        config.backup.pg_dump_path.clone(),
        config.backup.psql_path.clone(),
    ));
    let mut backups = BackupService::new(
        store.clone(),
        storage.clone(),
        &config.backup,
        config.retention,
    )
    .with_producer(Arc::new(DatabaseProducer::new(dumper)));
    if config.backup.file_roots.is_empty() {
        tracing::warn!("BACKUP_FILE_ROOTS not set, file backups are disabled");
    } else {
        let filter = PathFilter::new(&config.backup.include, &config.backup.exclude)?;
        backups = backups.with_producer(Arc::new(FileProducer::new(
            config.backup.file_roots.clone(),
            filter,
        )));
    }
    let backups = Arc::new(backups);

    // Alerting and recovery
    let notifications = Arc::new(NotificationService::from_config(&config.notifications)?);
    tracing::info!(channels = ?notifications.channels(), "Notification channels configured");
    let alerts = Arc::new(AlertService::new(
        store.clone(),
        notifications.clone(),
        config.monitor.reminder_interval,
    ));
    let registry = Arc::new(CommandRegistry::with_builtins(
        backups.clone(),
        &config.recovery,
        config.monitor.health_check_url.clone(),
        config.monitor.health_check_timeout,
    )?);
    let recovery = Arc::new(RecoveryController::new(
        store.clone(),
        registry,
        alerts.clone(),
        notifications,
        config.recovery.clone(),
    ));
    recovery.seed_procedures().await?;

    let monitor = Arc::new(
        BackupMonitor::new(
            store.clone(),
            alerts.clone(),
            storage.clone(),
            config.monitor.clone(),
        )?
        .with_reporter(recovery.clone()),
    );

    let scheduler = Arc::new(BackupScheduler::new(store.clone(), backups.clone()));
    scheduler.restore_timers(chrono::Utc::now()).await?;

    let reports = Arc::new(ReportService::new(store, config.recovery.clone()));

    // Background loops
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.clone(), SCHEDULER_TICK));
    let monitor_task = tokio::spawn(monitor.clone().run(shutdown.clone()));
    spawn_maintenance(backups.clone(), db_pool.clone(), shutdown.clone());

    let mut app_state = api::AppState::new(scheduler, backups, alerts, monitor, recovery, reports);
    app_state.set_metrics_handle(metrics_handle);
    let state = Arc::new(app_state);

    // Build router
    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(axum::middleware::from_fn(metrics_service::metrics_middleware))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(scheduler_task, monitor_task);
    cleanup_work_dir(&config.backup.work_dir).await;
    tracing::info!("Backup Keeper stopped");

    Ok(())
}

/// Spawn retention cleanup and pool gauge updates.
fn spawn_maintenance(backups: Arc<BackupService>, db_pool: sqlx::PgPool, shutdown: CancellationToken) {
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = interval(RETENTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = backups.cleanup_old_backups(chrono::Utc::now()).await {
                            tracing::warn!("Retention cleanup failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut ticker = interval(POOL_GAUGE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => metrics_service::set_db_pool_gauges(&db_pool),
            }
        }
    });
}

/// Remove leftovers from interrupted producer runs.
async fn cleanup_work_dir(work_dir: &Path) {
    match tokio::fs::read_dir(work_dir).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                if is_file {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::debug!(path = %path.display(), "Could not remove scratch file: {}", e);
                    }
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not read work directory: {}", e),
    }
}
