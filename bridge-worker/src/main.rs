//! Watch a directory for SCOM XML exports and deliver their alerts as OBM events.
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use bridge_common::circuit_breaker::CircuitBreaker;
use bridge_common::dlq::DeadLetterStore;
use bridge_common::metrics::{serve, setup_metrics_router};
use bridge_worker::audit::JsonlAuditLog;
use bridge_worker::client::{HttpSubmitter, RetryClassifier};
use bridge_worker::config::{load_config, ConfigProvider};
use bridge_worker::error::WorkerError;
use bridge_worker::notify::Notifier;
use bridge_worker::orchestrator::DeliveryOrchestrator;
use bridge_worker::queue::TaskQueue;
use bridge_worker::watcher::SourceWatcher;
use futures::future::ready;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DISPATCHER_HEARTBEAT: Duration = Duration::from_secs(10);

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "scom obm bridge"
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

/// Re-read the configuration on every SIGHUP. Rejected reloads keep the running values.
async fn reload_on_hangup(provider: Arc<ConfigProvider>, notifier: Notifier) {
    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(e) => {
            warn!("failed to install SIGHUP handler, reloading disabled: {}", e);
            return;
        }
    };

    while hangups.recv().await.is_some() {
        info!("received SIGHUP, reloading configuration");
        let result = load_config().and_then(|candidate| provider.reload(&candidate));
        match result {
            Ok(true) => {}
            Ok(false) => info!("configuration unchanged"),
            Err(e) => {
                error!("configuration reload rejected: {}", e);
                notifier.publish_error(format!("configuration reload rejected: {e}"));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();
    info!("starting scom obm bridge");

    let config = load_config().expect("Invalid configuration:");
    let provider = Arc::new(ConfigProvider::new(&config).expect("Invalid configuration:"));
    let settings = provider.static_settings().clone();

    let liveness = HealthRegistry::new("liveness");
    let watcher_deadline = provider.current().watch.polling_interval * 4 + Duration::from_secs(30);
    let watcher_liveness = liveness
        .register("source-watcher", watcher_deadline)
        .await;
    let dispatcher_liveness = liveness
        .register("dispatcher", DISPATCHER_HEARTBEAT * 3)
        .await;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_router()
        .map_err(|e| WorkerError::Metrics(e.to_string()))?
        .merge(router);
    let bind = settings.bind.clone();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let dead_letters = Arc::new(
        DeadLetterStore::open(
            &settings.dlq_directory,
            &settings.dlq_file_name,
            settings.dlq_max_file_bytes,
        )
        .await?,
    );
    let submitter =
        HttpSubmitter::new(&settings.endpoint).map_err(|e| WorkerError::Client(e.to_string()))?;
    let endpoint_path = config.endpoint.event_endpoint.as_str();
    let audit = JsonlAuditLog::open(&settings.audit_directory, endpoint_path).await?;

    let notifier = Notifier::default();
    let orchestrator = Arc::new(DeliveryOrchestrator::new(
        provider.subscribe(),
        Arc::new(CircuitBreaker::new(settings.circuit_breaker.clone())),
        RetryClassifier::new(
            settings.retryable_status_codes.clone(),
            settings.retryable_error_codes.clone(),
        ),
        Arc::new(submitter),
        dead_letters.clone(),
        Arc::new(audit),
        notifier.clone(),
    ));

    tokio::spawn(reload_on_hangup(provider.clone(), notifier.clone()));

    if settings.replay_dlq_on_start && dead_letters.size() > 0 {
        info!(records = dead_letters.size(), "replaying dead letters");
        match orchestrator.replay_dead_letters(|_| true).await {
            Ok(replayed) => info!(replayed, "startup replay finished"),
            Err(e) => error!("startup replay failed: {}", e),
        }
    }

    let queue = TaskQueue::new(settings.max_concurrent_batches);
    let (sender, receiver) = mpsc::channel(settings.batch_channel_capacity.max(1));
    let dispatcher = tokio::spawn(orchestrator.clone().run(
        receiver,
        queue.clone(),
        dispatcher_liveness,
        DISPATCHER_HEARTBEAT,
    ));

    let shutdown = CancellationToken::new();
    let watcher = SourceWatcher::new(
        provider.subscribe(),
        settings.encoding,
        settings.record_tag.clone(),
        sender,
        notifier,
        watcher_liveness,
    );
    let watcher = tokio::spawn(watcher.run(shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutting down, finishing in-flight batches");
    shutdown.cancel();

    match watcher.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("source watcher failed: {}", e),
        Err(e) => error!("source watcher task failed: {}", e),
    }
    if let Err(e) = dispatcher.await {
        error!("dispatcher task failed: {}", e);
    }
    queue.wait_idle().await;

    let statistics = orchestrator.statistics();
    info!(
        total = statistics.total,
        success = statistics.success,
        failed = statistics.failed,
        "shutdown complete"
    );
    Ok(())
}
