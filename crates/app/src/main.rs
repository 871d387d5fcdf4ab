use std::path::PathBuf;

use beatlight_core::{spawn_show, AppConfig, HttpDevice};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod console;
mod session;

#[tokio::main]
async fn main() -> beatlight_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Live => run_live(&config).await,
        Commands::Devices => run_devices(&config).await,
        Commands::State => run_state(&config).await,
    }
}

async fn run_live(config: &AppConfig) -> beatlight_core::Result<()> {
    let target = config.device.target()?;
    tracing::info!(base_url = %target.base_url, device = %target.device_id, "starting live session");

    let device = HttpDevice::new(&target)?;
    let (show, task) = spawn_show(device, config)?;

    let mut console = session::Console::new(show);
    let outcome = console.run().await;

    let show = console.into_handle();
    if show.shutdown().await.is_err() {
        tracing::debug!("show ended before shutdown was requested");
    }
    match task.await {
        Ok(status) => {
            println!("{}", status.latency);
            println!(
                "dispatched={}, failed={}, skipped beats={}",
                status.dispatched, status.failures, status.skipped_beats
            );
        }
        Err(err) => tracing::error!(%err, "show task did not finish cleanly"),
    }
    outcome
}

async fn run_devices(config: &AppConfig) -> beatlight_core::Result<()> {
    let device = HttpDevice::new(&config.device.target()?)?;
    let devices = device.list_devices().await?;
    println!("{devices:#}");
    Ok(())
}

async fn run_state(config: &AppConfig) -> beatlight_core::Result<()> {
    let device = HttpDevice::new(&config.device.target()?)?;
    let state = device.device_state().await?;
    println!("{state:#}");
    Ok(())
}

/// File settings first, then flags and environment on top.
fn load_config(cli: &Cli) -> beatlight_core::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    if let Some(base_url) = &cli.base_url {
        config.device.base_url = Some(base_url.clone());
    }
    if let Some(device_id) = &cli.device_id {
        config.device.device_id = Some(device_id.clone());
    }
    if let Some(bpm) = cli.bpm {
        config.tempo.initial_bpm = bpm;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised LED controller", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of the magic-home-rest API, e.g. http://192.168.1.20:8080
    #[arg(long, env = "BEATLIGHT_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Controller id as reported by the `devices` command.
    #[arg(long, env = "BEATLIGHT_DEVICE_ID", global = true)]
    device_id: Option<String>,

    /// Starting tempo.
    #[arg(long, global = true)]
    bpm: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an interactive, beat-synchronised session.
    Live,
    /// List the controllers known to the API.
    Devices,
    /// Print the current state of the configured controller.
    State,
}
