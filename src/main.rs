use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use onboard_drip::channels::{ContentCatalog, Notifier, TelegramNotifier};
use onboard_drip::config::ServiceConfig;
use onboard_drip::nudges::{Dispatcher, Scheduler, spawn_dispatcher};
use onboard_drip::onboarding::{
    MessagePlan, OnboardingRouteState, Stage, StageTransitionCoordinator, onboarding_routes,
};
use onboard_drip::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    let bot_token = match config.require_telegram_token() {
        Ok(token) => token,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("  export TELEGRAM_BOT_TOKEN=123456:ABC...");
            std::process::exit(1);
        }
    };

    eprintln!("📬 Onboard Drip v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Content: {}", config.content_path.display());
    eprintln!("   Plan timezone: UTC{}", config.plan_timezone);
    eprintln!(
        "   Dispatcher: every {}s, batch {}, {} concurrent sends",
        config.dispatcher.poll_interval.as_secs(),
        config.dispatcher.batch_limit,
        config.dispatcher.max_concurrent_sends
    );
    eprintln!("   API: http://0.0.0.0:{}/api/entities/{{id}}", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Content + notifier ──────────────────────────────────────────────
    let catalog = ContentCatalog::load(&config.content_path).with_context(|| {
        format!(
            "failed to load content catalog from {}",
            config.content_path.display()
        )
    })?;
    let planned_refs = Stage::ALL
        .into_iter()
        .filter_map(MessagePlan::for_stage)
        .flat_map(|plan| plan.entries.iter().map(|e| e.content_ref));
    let missing = catalog.missing(planned_refs);
    if !missing.is_empty() {
        tracing::warn!(missing = ?missing, "Content catalog lacks planned nudges; they will fail at send time");
    }
    let notifier: Arc<dyn Notifier> =
        Arc::new(TelegramNotifier::new(bot_token, Arc::new(catalog)));

    // ── Scheduling ──────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&db), config.plan_timezone));
    let coordinator = Arc::new(StageTransitionCoordinator::new(
        Arc::clone(&db),
        scheduler,
    ));

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        notifier,
        config.dispatcher.clone(),
    ));
    let dispatcher_handle = spawn_dispatcher(dispatcher, shutdown.clone());

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = onboarding_routes(OnboardingRouteState { coordinator }).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP server started");

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {e}");
                return;
            }
            tracing::info!("Ctrl-C received, draining");
            shutdown.cancel();
        }
    });

    server.await.context("HTTP server failed")?;
    shutdown.cancel();
    if let Err(e) = dispatcher_handle.await {
        tracing::error!("Dispatcher task ended abnormally: {e}");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
