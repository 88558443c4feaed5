mod config;
mod error;
mod logging;
mod proxy;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Args, Parser, Subcommand};
use reqwest::Client;
use tracing_subscriber::EnvFilter;

use crate::config::{ProxyConfig, load_config};
use crate::proxy::{ProxyService, router as proxy_router};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "venice-proxy")]
#[command(about = "OpenAI-compatible proxy for the Venice API", long_about = None)]
struct Cli {
    /// Config file; defaults to ~/.venice-proxy/config.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    listen: ListenArgs,
}

#[derive(Args, Debug, Clone, Default)]
struct ListenArgs {
    /// Listen host, overrides config and HOST
    #[arg(long)]
    host: Option<String>,
    /// Listen port, overrides config and PORT
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server (default)
    Serve(ListenArgs),
    /// Print the effective configuration as TOML
    Config,
}

fn resolve_config(config: Option<&Path>, listen: &ListenArgs) -> Result<ProxyConfig> {
    let mut cfg = load_config(config)?;
    if let Some(host) = &listen.host {
        cfg.listen.host = host.clone();
    }
    if let Some(port) = listen.port {
        cfg.listen.port = port;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    // info by default; RUST_LOG takes precedence when set. Logs go to stderr
    // so `venice-proxy config` output stays clean TOML.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Config) => {
            let cfg = resolve_config(cli.config.as_deref(), &cli.listen)?;
            let text = toml::to_string_pretty(&cfg).context("failed to render config")?;
            print!("{text}");
        }
        Some(Command::Serve(args)) => {
            let listen = ListenArgs {
                host: args.host.or(cli.listen.host),
                port: args.port.or(cli.listen.port),
            };
            run_server(resolve_config(cli.config.as_deref(), &listen)?).await?;
        }
        None => run_server(resolve_config(cli.config.as_deref(), &cli.listen)?).await?,
    }

    Ok(())
}

async fn run_server(cfg: ProxyConfig) -> Result<()> {
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build upstream http client")?;

    let listener = tokio::net::TcpListener::bind((cfg.listen.host.as_str(), cfg.listen.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cfg.listen.host, cfg.listen.port))?;
    let addr = listener.local_addr()?;

    let cfg = Arc::new(cfg);
    tracing::info!(
        upstream = %cfg.upstream_base(),
        mount_prefix = %cfg.mount_prefix,
        max_retries = cfg.retry.max_retries,
        timeout_secs = cfg.request_timeout_secs,
        "venice-proxy listening on http://{}",
        addr
    );

    let proxy = ProxyService::new(client, cfg);
    let app: Router = proxy_router(proxy);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("venice-proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!("failed to install signal handlers: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received, draining connections");
}
