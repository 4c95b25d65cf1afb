use anyhow::Context;
use clap::Parser;
use shoal::Configuration;
use shoal_server::Server;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Storage server speaking the shoal framed protocol.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// The TCP port to listen on.
    #[arg(long, default_value = "4711", env = "SHOAL_PORT")]
    port: u16,

    /// Configuration file to use instead of the standard lookup.
    #[arg(long, env = "SHOAL_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Maximum number of concurrent client sessions.
    #[arg(long, default_value = "256", env = "SHOAL_MAX_SESSIONS")]
    max_sessions: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Configuration::from_file(path)?,
        None => Configuration::load()?,
    };

    let object = shoal_backend::object_backend(&config.object.backend, &config.object.path)
        .context("initializing object backend")?;
    let kv = shoal_backend::kv_backend(&config.kv.backend, &config.kv.path)
        .context("initializing kv backend")?;

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.port))
        .await
        .context("failed to bind server port")?;
    tracing::info!(port = cli.port, "shoal server listening");

    let stop = CancellationToken::new();
    tokio::spawn(watch_signals(stop.clone()));

    let server = Server::new(object, kv, cli.max_sessions);
    server.run(listener, stop).await?;

    tracing::info!("shoal server stopped");
    Ok(())
}

fn install_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}

/// Initiate graceful shutdown on SIGINT, SIGTERM, SIGQUIT, or SIGHUP.
/// (SIGPIPE is ignored by default; broken peers surface as I/O errors.)
async fn watch_signals(stop: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to listen for SIGINT");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
    let mut quit = signal(SignalKind::quit()).expect("failed to listen for SIGQUIT");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to listen for SIGHUP");

    tokio::select! {
        _ = interrupt.recv() => (),
        _ = terminate.recv() => (),
        _ = quit.recv() => (),
        _ = hangup.recv() => (),
    }

    tracing::info!("received shutdown signal");
    stop.cancel();
}
