use anyhow::Context;
use clap::Parser; // for cli
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use agent_gateway::rate_limit::idle_sweeper;
use agent_gateway::server::{admin_router, gateway_router, serve, shutdown_signal};
use agent_gateway::{
    AdmissionController, AppState, Args, Forwarder, GatewayConfig, RoutingTable,
    SlidingWindowLimiter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments
    let args = Args::parse();
    init_tracing(&args.log_level);

    // a bad routing table is fatal, we never start serving with one
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    let routes = RoutingTable::new(config.service_definitions()?)
        .context("invalid service definitions")?;

    for route in routes.iter() {
        tracing::info!(
            service = %route.name,
            upstream = %route.upstream,
            auth = route.auth.kind(),
            rate_limit = ?route.rate_limit,
            "route configured"
        );
    }

    let limiter: Arc<dyn AdmissionController> = Arc::new(SlidingWindowLimiter::new());
    let forwarder = Forwarder::new(args.connect_timeout(), args.upstream_timeout())
        .context("failed to build upstream client")?;
    let state = Arc::new(AppState::new(routes, Arc::clone(&limiter), forwarder));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    // spawn the idle window sweeper
    if let Some(every) = args.sweep_interval() {
        tokio::spawn(idle_sweeper(Arc::clone(&limiter), every, shutdown.clone()));
    }

    if let Some(admin_port) = args.admin_port {
        let admin_addr = format!("0.0.0.0:{}", admin_port);
        let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
            .await
            .with_context(|| format!("failed to bind admin port {admin_addr}"))?;
        tracing::info!("Admin endpoints on http://{}", admin_addr);

        let admin_app = admin_router(Arc::clone(&state));
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server failed");
            }
        });
    }

    let port = args.port.unwrap_or_else(|| config.listen_port());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        "Gateway listening on http://{} with {} services",
        addr,
        state.routes.len()
    );

    serve(listener, gateway_router(state), shutdown, args.shutdown_grace()).await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

// RUST_LOG wins over --log-level
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
