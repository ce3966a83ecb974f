//! # Autodev Service
//!
//! Binary entry point for the Autodev HTTP service.
//!
//! This executable:
//! - Loads configuration from a JSON file plus environment overrides
//! - Initializes structured logging (stdout and a daily-rotated JSON file)
//! - Wires the clock, store, breakers, router, token manager, worktree and
//!   session managers into the orchestrator
//! - Starts the background health monitor, token daemon, poller, and
//!   archive sweep
//! - Serves HTTP until a shutdown signal, then lets in-flight work finish
//!   inside the grace period before forcing exit

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use async_trait::async_trait;
use autodev_core::circuit_breaker::{CircuitBreakerConfig, ProviderBreakers};
use autodev_core::providers::{HealthMonitor, HealthMonitorConfig, HttpTokenRefresher, TokenManager};
use autodev_core::routing::RoutingEngine;
use autodev_core::session::SessionManager;
use autodev_core::tracker::{IssueQuery, RateLimitBudget, TrackerClient, TrackerError};
use autodev_core::worktree::{SystemGitRunner, WorktreeManager};
use autodev_core::{
    Clock, HttpExecutorFactory, IssueDescriptor, IssueId, Orchestrator, OrchestratorConfig,
    Poller, PollerConfig, ProviderRouter, Reporter, RetryConfig, StateStore, SystemClock,
};

use autodev_service::config::AppConfig;
use autodev_service::ingress::IngressPipeline;
use autodev_service::{create_router, AppState};

/// Command-line flags.
#[derive(Debug, Parser)]
#[command(name = "autodev-service", about = "Autodev coding-agent orchestrator")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "AUTODEV_CONFIG", default_value = "autodev.json")]
    config: PathBuf,
}

/// Stand-in tracker client.
///
/// The upstream tracker's REST surface is integrated by injecting a real
/// [`TrackerClient`] here; until then side effects are logged so every
/// terminal session still leaves an operator-visible trace.
struct LogOnlyTracker;

#[async_trait]
impl TrackerClient for LogOnlyTracker {
    async fn update_state(&self, issue: &IssueId, state: &str) -> Result<(), TrackerError> {
        info!(issue = %issue, state, "tracker state update");
        Ok(())
    }

    async fn add_label(&self, issue: &IssueId, label: &str) -> Result<(), TrackerError> {
        info!(issue = %issue, label, "tracker label added");
        Ok(())
    }

    async fn post_comment(&self, issue: &IssueId, body: &str) -> Result<(), TrackerError> {
        info!(issue = %issue, chars = body.len(), "tracker comment posted");
        Ok(())
    }

    async fn search_issues(
        &self,
        _query: &IssueQuery,
    ) -> Result<Vec<IssueDescriptor>, TrackerError> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Configuration problems are fatal before anything is spawned.
    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    // Stdout gets the human format; the daily file gets JSON lines.
    if let Err(e) = std::fs::create_dir_all(config.paths.log_dir()) {
        eprintln!("fatal: cannot create log directory: {e}");
        std::process::exit(1);
    }
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_suffix("log")
        .build(config.paths.log_dir())
        .expect("log directory is writable");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autodev_service=info,autodev_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();

    info!(config = %args.config.display(), "starting autodev service");

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Persistence root.
    let store = StateStore::open(config.paths.state_root.clone()).await?;

    // Breakers and provider routing.
    let breakers = Arc::new(
        ProviderBreakers::load(store.clone(), Arc::clone(&clock), CircuitBreakerConfig::default())
            .await?,
    );
    let router = Arc::new(ProviderRouter::new(
        config.providers.clone(),
        Arc::clone(&breakers),
        Arc::clone(&clock),
    ));

    // OAuth token daemon, when a refresh endpoint is configured.
    if let Some(endpoint) = &config.token_refresh_endpoint {
        let refresher = Arc::new(HttpTokenRefresher::new(endpoint.clone(), None));
        let tokens = TokenManager::load(config.paths.token_path(), Arc::clone(&clock), refresher)
            .await?;
        tokens.spawn_refresh_daemon(shutdown_rx.clone());
        info!("token refresh daemon started");
    }

    // Worktrees and sessions.
    let worktrees = Arc::new(WorktreeManager::new(
        config.paths.worktree_base(),
        Arc::clone(&clock),
        Arc::new(SystemGitRunner),
    ));
    let sessions = Arc::new(SessionManager::load(store.clone(), Arc::clone(&clock)).await?);

    // Routing and reporting.
    let routing = Arc::new(RoutingEngine::new(
        config.repositories.clone(),
        config.label_rules.clone(),
        config.default_worktree_mode,
    ));
    let tracker: Arc<dyn TrackerClient> = Arc::new(LogOnlyTracker);
    let reporter = Arc::new(Reporter::new(Arc::clone(&tracker)));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&clock),
        routing,
        Arc::clone(&router),
        Arc::clone(&worktrees),
        Arc::clone(&sessions),
        reporter,
        Arc::new(HttpExecutorFactory),
        OrchestratorConfig {
            execution_timeout: Duration::from_millis(config.execution_timeout_ms),
            retry: RetryConfig::default(),
            ..Default::default()
        },
    ));

    // Background tasks.
    let monitor = Arc::new(HealthMonitor::new(
        store.clone(),
        Arc::clone(&clock),
        Arc::clone(&router),
        HealthMonitorConfig {
            interval: Duration::from_millis(config.health_interval_ms),
            ..Default::default()
        },
    ));
    monitor.spawn(shutdown_rx.clone());

    let poller = Arc::new(Poller::new(
        Arc::clone(&clock),
        Arc::clone(&tracker),
        Arc::clone(&sessions),
        Arc::clone(&orchestrator) as Arc<dyn autodev_core::poller::IssueProcessor>,
        Arc::new(RateLimitBudget::default()),
        PollerConfig {
            labels: config.label_rules.auto_execute.clone(),
            ..Default::default()
        },
    ));
    poller.spawn(shutdown_rx.clone());

    spawn_archive_sweep(Arc::clone(&sessions), Arc::clone(&clock), shutdown_rx.clone());

    // HTTP surface.
    let pipeline = Arc::new(IngressPipeline::new(
        Arc::clone(&clock),
        config.webhook_secret.clone(),
        Arc::clone(&sessions),
        Arc::clone(&orchestrator) as Arc<dyn autodev_core::poller::IssueProcessor>,
        config.agent_name.clone(),
    ));

    let state = AppState {
        pipeline: Arc::clone(&pipeline),
        router,
        sessions,
        worktrees,
        clock,
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // In-flight executions get the grace period, then the process exits
    // hard with code 1.
    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    let deadline = tokio::time::Instant::now() + grace;
    while pipeline.live_count().await > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(grace_secs = grace.as_secs(), "grace period elapsed, forcing exit");
            std::process::exit(1);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Daily sweep deleting archived sessions past retention.
fn spawn_archive_sweep(
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = clock.sleep(Duration::from_secs(24 * 60 * 60)) => {
                    if let Err(e) = sessions.prune_archives().await {
                        warn!(error = %e, "archive sweep failed");
                    }
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
