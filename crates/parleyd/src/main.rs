//! parleyd: Parley directory server and chat peer.
//!
//!   parleyd -s [port]
//!   parleyd -c <nickname> <server-ip> <server-port> <client-port>

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use parley_core::config::ParleyConfig;
use parley_services::{server, PeerError, PeerNode, ReliableChannel};

mod terminal;

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Server {
        /// Falls back to `server.port` from the config when absent.
        port: Option<u16>,
    },
    Client {
        nickname: String,
        server: SocketAddr,
        port: u16,
    },
    Help,
}

fn parse_args(args: &[&str]) -> Result<Mode> {
    match args {
        ["-s"] => Ok(Mode::Server { port: None }),
        ["-s", port] => Ok(Mode::Server {
            port: Some(port.parse().context("server port must be a number")?),
        }),
        ["-c", nickname, server_ip, server_port, client_port] => {
            let ip: IpAddr = server_ip.parse().context("server address must be an IP")?;
            let server_port: u16 = server_port.parse().context("server port must be a number")?;
            Ok(Mode::Client {
                nickname: nickname.to_string(),
                server: SocketAddr::new(ip, server_port),
                port: client_port.parse().context("client port must be a number")?,
            })
        }
        ["help"] | ["--help"] | ["-h"] => Ok(Mode::Help),
        other => bail!("unknown arguments: {}", other.join(" ")),
    }
}

fn print_usage() {
    println!("Usage:");
    println!("  parleyd -s [port]                                        run the directory server");
    println!("  parleyd -c <nickname> <server-ip> <server-port> <port>   run a chat peer");
    println!();
    println!("Configuration: $PARLEY_CONFIG or ~/.config/parley/config.toml");
    println!("Logging:       RUST_LOG (default: info)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mode = match parse_args(&args) {
        Ok(Mode::Help) => {
            print_usage();
            return Ok(());
        }
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{e:#}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = ParleyConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ParleyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ParleyConfig::default()
    });

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match mode {
        Mode::Server { port } => {
            run_server(&config, server_port(port, &config), shutdown_tx).await
        }
        Mode::Client {
            nickname,
            server,
            port,
        } => run_client(&config, &nickname, server, port, shutdown_tx).await,
        Mode::Help => Ok(()),
    }
}

/// `-s <port>` wins over `server.port` from env, file or defaults.
fn server_port(arg: Option<u16>, config: &ParleyConfig) -> u16 {
    arg.unwrap_or(config.server.port)
}

fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("invalid bind_host {host:?}"))?;
    Ok(SocketAddr::new(ip, port))
}

async fn run_server(config: &ParleyConfig, port: u16, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let addr = bind_addr(&config.server.bind_host, port)?;
    let channel = Arc::new(
        ReliableChannel::bind(addr, config.transport.clone())
            .await
            .with_context(|| format!("failed to bind directory server on {addr}"))?,
    );
    tracing::info!(%addr, "directory server listening");

    let (_directory, dispatcher) = server(channel, config.dispatch.clone(), shutdown_tx.subscribe());
    dispatcher.run().await;

    tracing::info!("directory server stopped");
    Ok(())
}

async fn run_client(
    config: &ParleyConfig,
    nickname: &str,
    server: SocketAddr,
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let addr = bind_addr(&config.client.bind_host, port)?;
    let channel = Arc::new(
        ReliableChannel::bind(addr, config.transport.clone())
            .await
            .with_context(|| format!("failed to bind peer on {addr}"))?,
    );
    tracing::info!(%addr, %server, nickname, "peer starting");

    let (node, dispatcher, events) = PeerNode::start(
        channel,
        server,
        &config.client,
        config.dispatch.clone(),
        shutdown_tx.subscribe(),
    );
    let dispatch_task = tokio::spawn(dispatcher.run());
    let printer = tokio::spawn(terminal::print_events(events));

    let registered = match node.register(nickname).await {
        Ok(_) => {
            terminal::announce("Welcome, you are registered.");
            Ok(())
        }
        Err(e @ PeerError::ServerUnreachable(_)) => Err(e).context("registration failed"),
        Err(e) => Err(e).with_context(|| format!("could not register as {nickname:?}")),
    };

    if registered.is_ok() {
        terminal::run(node, shutdown_tx.subscribe()).await?;
    }

    let _ = shutdown_tx.send(());
    let _ = dispatch_task.await;
    printer.abort();
    registered
}
