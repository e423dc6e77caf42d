use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use kubestream_k8s::{KubeClient, KubeSources};
use kubestream_web::{AppState, create_router};

mod config;

use config::Config;

/// Kubestream - live and historical log streaming for Kubernetes pods
#[derive(Parser, Debug)]
#[command(name = "kubestream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Kubernetes context name (current context if not provided)
    #[arg(long)]
    context: Option<String>,

    /// Namespace clients may read; repeat for several
    #[arg(long = "namespace", short = 'n', value_name = "NAMESPACE")]
    namespaces: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let result = run(args).await;

    // Handle any errors
    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?.with_overrides(
        args.addr,
        args.context,
        args.namespaces,
    );
    config.validate()?;

    let default_directive: Directive = config
        .log
        .level
        .parse()
        .with_context(|| format!("Invalid log level: {}", config.log.level))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_directive)
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let kube = KubeClient::new();
    let context = config
        .kubernetes
        .context
        .as_deref()
        .or(kube.current_context())
        .map(str::to_string);
    let client = kube.connect(config.kubernetes.context.as_deref()).await?;
    info!(
        context = context.as_deref().unwrap_or("in-cluster"),
        namespaces = ?config.kubernetes.namespaces,
        "connected to cluster"
    );

    let sources = KubeSources::new(client, config.kubernetes.namespaces.clone())
        .with_container(config.kubernetes.container.clone())
        .with_discovery_interval(config.discovery_interval());
    let app = create_router(AppState::new(Arc::new(sources), config.stream_settings()));

    let listener = tokio::net::TcpListener::bind(config.server.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.addr))?;
    info!(addr = %config.server.addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
