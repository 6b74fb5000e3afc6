//! mcpfuse - MCP aggregation proxy
//!
//! Usage:
//!   MCP_API_KEY=<key> mcpfuse              # stdio upstream
//!   MCP_TRANSPORT=sse mcpfuse              # HTTP+SSE upstream on BIND_ADDRESS
//!
//! Backends are resolved per credential from `API_KEYS_FILE` and
//! `SERVERS_CONFIG`, or from `RESOLVER_URL` when set.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use mcpfuse_proxy::bridge::{self, BridgeState};
use mcpfuse_proxy::mcp::TransportConnector;
use mcpfuse_proxy::{Config, LogFormat, Session, UpstreamMode};
use mcpfuse_shared::{DescriptorResolver, HttpResolver, StaticResolver};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::Pretty);
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "mcpfuse exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Logs always go to stderr; stdout belongs to the stdio upstream
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcpfuse=info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn build_resolver(config: &Config) -> anyhow::Result<Arc<dyn DescriptorResolver>> {
    match &config.resolver_url {
        Some(url) => {
            tracing::info!(url = %url, "Resolving backends over HTTP");
            let resolver = HttpResolver::new(url.clone()).context("Failed to build HTTP resolver")?;
            Ok(Arc::new(resolver))
        }
        None => {
            tracing::info!(
                keys = %config.api_keys_file,
                servers = %config.servers_config,
                "Resolving backends from local files"
            );
            Ok(Arc::new(StaticResolver::new(
                config.api_keys_file.clone(),
                config.servers_config.clone(),
            )))
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let resolver = build_resolver(&config)?;
    let connector = Arc::new(TransportConnector::new().context("Failed to build backend connector")?);

    match config.mode {
        UpstreamMode::Stdio => run_stdio(&config, resolver.as_ref(), connector).await,
        UpstreamMode::Sse => run_sse(&config, resolver, connector).await,
    }
}

async fn run_stdio(
    config: &Config,
    resolver: &dyn DescriptorResolver,
    connector: Arc<TransportConnector>,
) -> anyhow::Result<()> {
    let credential = config.api_key.as_deref().context("MCP_API_KEY is not set")?;

    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::open(credential, resolver, connector, config.timeouts(), tx)
        .await
        .context("Failed to open session")?;

    let catalog = session.router().supervisor().catalog().snapshot();
    tracing::info!(
        session_id = %session.id(),
        capabilities = catalog.len(),
        backends = catalog.backends().len(),
        "Serving on stdio"
    );

    let served = tokio::select! {
        result = bridge::stdio::serve(&session, tokio::io::stdin(), tokio::io::stdout(), rx) => result,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    session.close().await;
    served.context("Upstream connection failed")
}

async fn run_sse(
    config: &Config,
    resolver: Arc<dyn DescriptorResolver>,
    connector: Arc<TransportConnector>,
) -> anyhow::Result<()> {
    let state = BridgeState::new(resolver, connector, config.timeouts(), config.api_key.clone());
    let sessions = state.sessions.clone();
    let app = bridge::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "SSE bridge listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sessions.close_all().await;
    tracing::info!("All sessions closed");
    served.context("HTTP server failed")
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
