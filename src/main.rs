use cinemate::config_loader::{LogFormat, RunMode, Settings};
use cinemate::control;
use cinemate::modes;
use cinemate::orchestrator::Orchestrator;
use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FLUSH_LIMIT: Duration = Duration::from_secs(2);

/// Watch-along companion daemon
#[derive(Parser)]
#[command(name = "cinemate")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "A companion that watches videos with you and knows when to speak", long_about = None)]
struct Cli {
    /// Run mode (overrides the configured one)
    #[arg(short, long, value_enum)]
    mode: Option<RunMode>,

    /// Extra configuration file layered over the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    /// Port for the control interface (overrides the configured one)
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cinemate=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        settings.mode = mode;
    }
    if let Some(port) = cli.port {
        settings.control_port = port;
    }
    if cli.json {
        settings.log_format = LogFormat::Json;
    }
    init_logging(settings.log_format);

    info!("CineMate {} starting", env!("CARGO_PKG_VERSION"));
    let assembly = modes::assemble(&settings).await?;
    let (mut orchestrator, handle) = Orchestrator::new(&settings, assembly.services);
    let sensors = orchestrator.spawn_sensors(assembly.sources);

    let control_handle = handle.clone();
    let port = settings.control_port;
    let control = tokio::spawn(async move {
        control::start_server(control_handle, port).await;
    });

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        info!("Interrupted, saying goodbye");
        shutdown_handle.shutdown().await;
    });

    orchestrator.run().await;

    control.abort();
    for sensor in sensors {
        sensor.abort();
    }
    drop(handle);
    for writer in assembly.background {
        if tokio::time::timeout(FLUSH_LIMIT, writer).await.is_err() {
            warn!("Activity log writer did not finish in time");
        }
    }
    Ok(())
}
