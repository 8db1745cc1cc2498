//! CLI Entry Point for ofdr-server
//!
//! Provides command-line interface for:
//! - Running the measurement gateway and scheduler against real or mock hardware
//! - Decoding an instrument frame offline
//!
//! # Usage
//!
//! Serve clients:
//! ```bash
//! ofdr-server serve --config config/ofdr.toml
//! ofdr-server serve --mock
//! ```
//!
//! Decode a frame:
//! ```bash
//! ofdr-server decode "OP_1.012_..._9_SN9II1_405.668_PO" --verify-checksum
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ofdr_control::config::{ControlConfig, RunMode};
use ofdr_control::hardware::fla::FlaInstrument;
use ofdr_control::hardware::mock::{MockFla, MockOpticalSwitch};
use ofdr_control::hardware::switch::SerialOpticalSwitch;
use ofdr_control::logging;
use ofdr_control::network::{Gateway, GatewayServer};
use ofdr_control::protocol::{decode_frame, ChecksumPolicy, CountValidation, FrameOptions};
use ofdr_control::scheduler::{DeviceBus, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ofdr-server")]
#[command(about = "Measurement-task scheduler for a shared OFDR instrument", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client gateway and scheduler until Ctrl-C
    Serve {
        /// Configuration file (defaults to config/ofdr.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use simulated hardware regardless of run_mode
        #[arg(long)]
        mock: bool,
    },

    /// Decode an OP_..._PO frame and print it as JSON
    Decode {
        /// Raw frame text
        frame: String,

        /// Require the decoded peak count to equal the declared count
        #[arg(long)]
        strict_count: bool,

        /// Check the scalar against the frame checksum
        #[arg(long)]
        verify_checksum: bool,

        /// Accepted checksum deviation
        #[arg(long, default_value_t = 0.1)]
        tolerance: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, mock } => serve(config, mock).await,
        Commands::Decode {
            frame,
            strict_count,
            verify_checksum,
            tolerance,
        } => decode(&frame, strict_count, verify_checksum, tolerance),
    }
}

async fn serve(path: Option<PathBuf>, mock: bool) -> Result<()> {
    let mut config = match &path {
        Some(path) => ControlConfig::load_from(path),
        None => ControlConfig::load(),
    }
    .context("loading configuration")?;
    if mock {
        config.application.run_mode = RunMode::Mock;
    }
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    info!(
        name = %config.application.name,
        run_mode = ?config.application.run_mode,
        "Starting"
    );

    let (bus, instrument) = build_bus(&config).await?;
    let scheduler = Scheduler::start(bus, config.scheduler.clone());
    let server = GatewayServer::bind(
        &config.server.listen_addr,
        Gateway::new(scheduler.clone()),
        config.server.idle_timeout,
    )
    .await
    .context("binding gateway listener")?;

    let shutdown = CancellationToken::new();
    let gateway = tokio::spawn(server.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    scheduler.shutdown().await;
    gateway.await?;
    if let Some(instrument) = instrument {
        instrument.disconnect().await;
    }
    Ok(())
}

/// Hardware for the configured run mode. The real instrument handle is
/// returned as well so it can be closed cleanly on exit.
async fn build_bus(config: &ControlConfig) -> Result<(DeviceBus, Option<Arc<FlaInstrument>>)> {
    match config.application.run_mode {
        RunMode::Mock => {
            let switch = MockOpticalSwitch::new(config.switch.outputs.iter().copied());
            let fla = MockFla::new().with_frame_options(config.fla.frame_options());
            Ok((DeviceBus::new(Arc::new(switch), Arc::new(fla)), None))
        }
        RunMode::Real => {
            let switch = SerialOpticalSwitch::open(&config.switch)
                .await
                .with_context(|| format!("opening switch on {}", config.switch.port))?;

            let fla = match FlaInstrument::connect(&config.fla).await {
                Ok(fla) => fla,
                Err(e) => {
                    warn!(error = %e, "FLA not reachable; will connect on first task");
                    FlaInstrument::deferred(&config.fla)
                }
            };
            let fla = Arc::new(fla);
            let bus = DeviceBus::new(Arc::new(switch), fla.clone());
            Ok((bus, Some(fla)))
        }
    }
}

fn decode(frame: &str, strict_count: bool, verify_checksum: bool, tolerance: f64) -> Result<()> {
    let mut options = FrameOptions::default();
    if strict_count {
        options = options.with_count_validation(CountValidation::Exact);
    }
    if verify_checksum {
        options = options.with_checksum(ChecksumPolicy::Verify { tolerance });
    }

    let result = decode_frame(frame, &options).context("frame rejected")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
