use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wharfd::api::daemonlog::{DaemonLogBroadcaster, DaemonLogLayer};
use wharfd::cert::{CertLoader, CertManager};
use wharfd::config::Config;
use wharfd::deploy::DeploymentManager;
use wharfd::health::{HealthChecker, HealthMonitor, RetryConfig, SharedTargets};
use wharfd::proxy::ProxyServer;
use wharfd::reconcile::Reconciler;
use wharfd::runtime::detect_runtime;
use wharfd::AppState;

#[derive(Parser, Debug)]
#[command(name = "wharfd")]
#[command(author, version, about = "Single-node container orchestrator with an integrated TLS proxy", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "wharfd.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let log_level = cli.log_level.as_ref().unwrap_or(&config.logging.level).clone();
    let daemon_log = DaemonLogBroadcaster::new(1024);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(DaemonLogLayer::new(daemon_log.clone()))
        .init();

    tracing::info!("starting wharfd v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = wharfd::api::metrics::init_metrics();

    let runtime = detect_runtime(&config.runtime).await;

    let checker = Arc::new(HealthChecker::new(config.health.timeout));
    let retry = RetryConfig {
        max_retries: config.health.max_retries,
        initial_backoff: config.health.initial_backoff,
        max_backoff: config.health.max_backoff,
    };
    let deploy = Arc::new(DeploymentManager::new(runtime.clone(), checker.clone(), retry));

    std::fs::create_dir_all(&config.acme.cert_dir)?;
    let cert_loader = Arc::new(CertLoader::new()?);
    let certs = Arc::new(CertManager::new(&config.acme, cert_loader.clone()).await?);

    let routes = Arc::new(wharfd::proxy::RouteTable::new());
    if let Some(api_domain) = &config.proxy.api_domain {
        routes.set_admin_route(
            api_domain,
            wharfd::proxy::Backend {
                container_id: "admin".to_string(),
                ip: "127.0.0.1".to_string(),
                port: config.server.admin_port,
            },
        );
    }
    let targets = Arc::new(SharedTargets::new());

    let health = Arc::new(
        HealthMonitor::new(
            HealthChecker::new(config.health.timeout),
            config.health.fall,
            config.health.rise,
            targets.clone(),
            config.health.interval,
            retry,
            config.health.max_concurrent,
        )
        .with_on_change({
            let routes = routes.clone();
            move |healthy| {
                let healthy_ids: std::collections::HashSet<String> = healthy.iter().map(|t| t.id.clone()).collect();
                tracing::debug!(healthy = healthy_ids.len(), "backend health set updated");
                routes.narrow_to_healthy(&healthy_ids);
            }
        }),
    );
    health.start();

    let reconciler = Arc::new(Reconciler::new(
        runtime.clone(),
        deploy.clone(),
        certs.clone(),
        routes.clone(),
        health.clone(),
        targets.clone(),
        config.reconcile.debounce,
        config.reconcile.periodic_interval,
        config.proxy.api_domain.clone(),
    ));
    tokio::spawn(reconciler.run());

    let challenges = certs.challenges();
    let challenge_responder = wharfd::cert::ChallengeResponder::new(config.acme.challenge_port, challenges);
    challenge_responder.start();

    let proxy_server = ProxyServer::new(routes.clone(), cert_loader, config.proxy.http_port, config.proxy.https_port, config.acme.challenge_port);
    tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            tracing::error!(error = %e, "proxy server exited");
        }
    });

    let state = Arc::new(
        AppState::new(config.clone(), runtime, deploy, certs, routes, health, targets, daemon_log).with_metrics(metrics_handle),
    );

    let app = wharfd::api::create_router(state);

    let admin_addr = format!("{}:{}", config.server.admin_host, config.server.admin_port);
    let listener = tokio::net::TcpListener::bind(&admin_addr).await?;
    tracing::info!(addr = %admin_addr, "admin API listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("wharfd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
