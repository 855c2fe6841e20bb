use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fogagent_daemon::{
    api,
    config::{AgentConfig, ToolPaths},
    docker::DockerCli,
    tc::TcCli,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fogagent", version, about = "Fog node agent: timed container and network changes")]
struct Cli {
    /// Where the HTTP API will listen.
    #[arg(long, default_value = "0.0.0.0:20200")]
    listen: String,

    /// Delay after a batch's latest action before its stage report is captured.
    #[arg(long, default_value_t = 1_000)]
    settle_ms: u64,

    /// Upper bound for a single docker/tc/ip invocation.
    #[arg(long, default_value_t = 10_000)]
    controller_timeout_ms: u64,

    /// Targets to report on from the start (repeatable).
    #[arg(long = "track", default_value = "docker0")]
    track: Vec<String>,

    /// Drop existing shaping rules on tracked targets at startup.
    #[arg(long, default_value_t = false)]
    reset_on_start: bool,

    #[arg(long, default_value = "docker")]
    docker_bin: PathBuf,
    #[arg(long, default_value = "tcset")]
    tcset_bin: PathBuf,
    #[arg(long, default_value = "tcshow")]
    tcshow_bin: PathBuf,
    #[arg(long, default_value = "tcdel")]
    tcdel_bin: PathBuf,
    #[arg(long, default_value = "ip")]
    ip_bin: PathBuf,

    /// Log level (env-filter syntax); RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = AgentConfig {
        listen: cli.listen,
        settle: Duration::from_millis(cli.settle_ms),
        controller_timeout: Duration::from_millis(cli.controller_timeout_ms),
        tracked: cli.track,
        reset_on_start: cli.reset_on_start,
        tools: ToolPaths {
            docker: cli.docker_bin,
            tcset: cli.tcset_bin,
            tcshow: cli.tcshow_bin,
            tcdel: cli.tcdel_bin,
            ip: cli.ip_bin,
        },
    };

    info!("starting agent with config: {:?}", config);

    let resources = Arc::new(DockerCli::new(config.tools.docker.clone()));
    let shaping = Arc::new(TcCli::new(&config.tools));
    let addr: SocketAddr = config.listen.parse()?;
    let reset_on_start = config.reset_on_start;

    let state = api::AppState::new(config, resources, shaping);
    if reset_on_start {
        state.reset_tracked().await;
    }

    let scheduler = state.scheduler.clone();
    let app = api::router(state);

    info!("listening on http://{}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let pending = scheduler.in_flight();
    if pending > 0 {
        info!(pending, "exiting with batches still scheduled; they are dropped");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
