// Minori command line client
// Drives a capture session against the inference backend from the terminal

mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use minori_core::{Crop, MinoriConfig};
use minori_eye::{CameraBackend, CameraDevice, CaptureError, SessionController, StillImageBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minori")]
#[command(about = "Minori crop disease detection client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Inference backend base URL
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Configuration file path (defaults to ~/.minori/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Send every frame as a discrete request
    #[arg(long, global = true)]
    no_realtime: bool,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream frames to the backend every capture interval
    Watch {
        /// Crop to analyse (rice, wheat)
        #[arg(long)]
        crop: Crop,

        /// Use a still image instead of a live camera
        #[arg(long)]
        still: Option<PathBuf>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Capture and analyse a single frame
    Capture {
        #[arg(long)]
        crop: Crop,

        #[arg(long)]
        still: Option<PathBuf>,
    },

    /// Analyse an image file
    Upload {
        #[arg(long)]
        crop: Crop,

        /// Image file (JPEG, PNG, WebP, BMP or GIF)
        path: PathBuf,
    },

    /// List the supported crops
    Crops,

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Check a configuration file
    Validate {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Watch { crop, still, duration_secs } => {
            let session = SessionController::new(config, camera_backend(still)?)?;
            watch(&session, crop, duration_secs.map(Duration::from_secs)).await?;
        }
        Commands::Capture { crop, still } => {
            let session = SessionController::new(config, camera_backend(still)?)?;
            capture(&session, crop).await?;
        }
        Commands::Upload { crop, path } => {
            let session = SessionController::new(config, Arc::new(NoCamera))?;
            upload(&session, crop, path).await?;
        }
        Commands::Crops => output::print_crops(),
        Commands::Config(cmd) => handle_config_command(&config, cmd)?,
    }

    Ok(())
}

/// File (explicit or default location), then environment, then flags
fn load_config(cli: &Cli) -> anyhow::Result<MinoriConfig> {
    let mut config = match &cli.config {
        Some(path) => MinoriConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let path = MinoriConfig::default_path();
            if path.exists() {
                MinoriConfig::from_file(&path)
                    .with_context(|| format!("Failed to load configuration from {}", path.display()))?
            } else {
                MinoriConfig::default()
            }
        }
    };

    config.apply_env();
    if let Some(backend) = &cli.backend {
        config.backend.base_url = backend.clone();
    }
    if cli.no_realtime {
        config.backend.realtime_enabled = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(config: &MinoriConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn camera_backend(still: Option<PathBuf>) -> anyhow::Result<Arc<dyn CameraBackend>> {
    match still {
        Some(path) => {
            let backend = StillImageBackend::from_path(&path)
                .with_context(|| format!("Failed to load still image {}", path.display()))?;
            Ok(Arc::new(backend))
        }
        None => live_camera(),
    }
}

#[cfg(feature = "opencv")]
fn live_camera() -> anyhow::Result<Arc<dyn CameraBackend>> {
    Ok(Arc::new(minori_eye::OpenCvBackend))
}

#[cfg(not(feature = "opencv"))]
fn live_camera() -> anyhow::Result<Arc<dyn CameraBackend>> {
    anyhow::bail!("Built without camera support: pass --still <image> or rebuild with --features opencv")
}

/// Stand-in for commands that never open the camera
struct NoCamera;

impl CameraBackend for NoCamera {
    fn open(&self, _config: &minori_core::CameraConfig) -> Result<Box<dyn CameraDevice>, CaptureError> {
        Err(CaptureError::DeviceUnavailable("no camera configured".to_string()))
    }

    fn name(&self) -> String {
        "none".to_string()
    }
}

async fn watch(session: &SessionController, crop: Crop, duration: Option<Duration>) -> anyhow::Result<()> {
    session.select_crop(Some(crop));
    session.start_camera().await?;

    let outcome = stream_results(session, duration).await;

    session.stop_camera().await;
    output::print_summary(session.frames_processed());
    outcome
}

async fn stream_results(session: &SessionController, duration: Option<Duration>) -> anyhow::Result<()> {
    let mut events = session.subscribe();
    session.start_realtime()?;
    output::print_watching(session);

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupted, stopping");
                break;
            }
            _ = &mut deadline => {
                debug!("Watch duration elapsed");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => output::print_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} session events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

async fn capture(session: &SessionController, crop: Crop) -> anyhow::Result<()> {
    session.select_crop(Some(crop));
    session.start_camera().await?;

    let outcome = match session.single_capture() {
        Ok(handle) => handle.wait().await,
        Err(e) => Err(e),
    };

    session.stop_camera().await;
    output::print_outcome(&outcome?);
    Ok(())
}

async fn upload(session: &SessionController, crop: Crop, path: PathBuf) -> anyhow::Result<()> {
    session.select_crop(Some(crop));
    let handle = session
        .upload_file(&path)
        .await
        .with_context(|| format!("Failed to submit {}", path.display()))?;
    output::print_outcome(&handle.wait().await?);
    Ok(())
}

fn handle_config_command(config: &MinoriConfig, cmd: ConfigCommands) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Validate { path } => {
            let candidate = MinoriConfig::from_file(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            candidate.validate()?;
            println!("{} is valid", path.display());
        }
    }
    Ok(())
}
