//! thermocal - acquisition and calibration host for the four channel probe
//!
//! Usage:
//!   thermocal ports
//!   thermocal monitor --port /dev/ttyUSB0
//!   thermocal capture --port /dev/ttyUSB0 --reference 90 --duration 30
//!   thermocal fit --calibration-id <uuid>
//!   thermocal export --calibration-id <uuid> --output log.csv

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use thermocal_lib::calibration::refit_channel;
use thermocal_lib::config::AppSettings;
use thermocal_lib::device::CHANNEL_COUNT;
use thermocal_lib::engine::{CaptureAck, CaptureOutcome, ProbeEvent, ProbeHandle};
use thermocal_lib::export::write_csv;
use thermocal_lib::serial::SerialInterface;

#[derive(Parser)]
#[command(name = "thermocal")]
#[command(about = "Temperature probe acquisition and calibration")]
#[command(version)]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Calibration API base URL
    #[arg(long, global = true)]
    api: Option<String>,

    /// Calibration project id
    #[arg(long, global = true)]
    calibration_id: Option<Uuid>,

    /// Keep the calibration log in memory instead of the API
    #[arg(long, global = true)]
    offline: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Stream converted temperatures
    Monitor {
        #[arg(short, long)]
        port: Option<String>,

        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Capture one calibration point and refit
    Capture {
        #[arg(short, long)]
        port: Option<String>,

        /// Reference temperature in °C
        #[arg(short, long)]
        reference: String,

        /// Averaging window in seconds (0 = instant)
        #[arg(short, long, default_value_t = 0)]
        duration: u64,

        /// Seconds of telemetry to collect before capturing
        #[arg(long, default_value_t = 3)]
        warmup: u64,

        /// Logical channels (1-4) to leave out
        #[arg(long, value_delimiter = ',')]
        skip: Vec<u8>,
    },

    /// Fit coefficients from the stored log
    Fit,

    /// Export the stored log as CSV
    Export {
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    thermocal_lib::init_logging(cli.verbose);

    let mut settings = match &cli.config {
        Some(path) => AppSettings::load(path)?,
        None => AppSettings::default(),
    };
    if let Some(api) = &cli.api {
        settings.api_base_url = api.clone();
    }
    if cli.calibration_id.is_some() {
        settings.calibration_id = cli.calibration_id;
    }

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Monitor { port, seconds } => {
            if port.is_some() {
                settings.port_name = port;
            }
            let store = thermocal_lib::build_store(&settings, cli.offline)?;
            let handle = thermocal_lib::start_session(settings, store).await?;
            monitor(&handle, seconds).await;
            handle.shutdown().await?;
            Ok(())
        }
        Commands::Capture { port, reference, duration, warmup, skip } => {
            if port.is_some() {
                settings.port_name = port;
            }
            let store = thermocal_lib::build_store(&settings, cli.offline)?;
            let handle = thermocal_lib::start_session(settings, store).await?;
            let result = capture(&handle, &reference, duration, warmup, &skip).await;
            handle.shutdown().await?;
            result
        }
        Commands::Fit => {
            let store = thermocal_lib::build_store(&settings, cli.offline)?;
            let entries = store.fetch_log().await.context("failed to fetch calibration log")?;
            for index in 0..CHANNEL_COUNT {
                let hardware_channel = settings.hardware_channel_offset + index as u32 + 1;
                match refit_channel(&entries, index) {
                    Ok((coeffs, source)) => println!(
                        "channel {:>2}: A={:.12e} B={:.12e} C={:.12e} D={:.12e} ({:?} points)",
                        hardware_channel, coeffs.a, coeffs.b, coeffs.c, coeffs.d, source
                    ),
                    Err(e) => println!("channel {:>2}: {}", hardware_channel, e),
                }
            }
            Ok(())
        }
        Commands::Export { output } => {
            let store = thermocal_lib::build_store(&settings, cli.offline)?;
            let entries = store.fetch_log().await.context("failed to fetch calibration log")?;
            write_csv(&output, &entries)?;
            println!("{} entries written to {}", entries.len(), output.display());
            Ok(())
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = SerialInterface::discover_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  {:04x}:{:04x}  {}",
                port.port_name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

async fn monitor(handle: &ProbeHandle, seconds: Option<u64>) {
    let mut events = handle.subscribe_events();
    let limit = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(limit);

    loop {
        tokio::select! {
            _ = &mut limit => break,
            event = events.recv() => match event {
                Ok(ProbeEvent::Telemetry(sample)) => {
                    let cells: Vec<String> = sample
                        .temperatures
                        .iter()
                        .map(|t| t.map(|c| format!("{:8.2}", c)).unwrap_or_else(|| "     ---".to_string()))
                        .collect();
                    println!("{}  {}", sample.timestamp.format("%H:%M:%S%.3f"), cells.join(" "));
                }
                Ok(ProbeEvent::TransportNotice { message }) => eprintln!("transport: {}", message),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => log::warn!("Dropped {} events", n),
                Err(_) => break,
            }
        }
    }
}

async fn capture(handle: &ProbeHandle, reference: &str, duration: u64, warmup: u64, skip: &[u8]) -> Result<()> {
    for logical_id in skip {
        handle.set_channel_active(*logical_id, false).await?;
    }
    tokio::time::sleep(Duration::from_secs(warmup)).await;

    let mut events = handle.subscribe_events();
    match handle.capture(reference, Duration::from_secs(duration)).await? {
        CaptureAck::Committed(outcome) => print_outcome(&outcome),
        CaptureAck::Averaging { duration, .. } => {
            println!("Averaging for {:?}...", duration);
            loop {
                match events.recv().await {
                    Ok(ProbeEvent::CaptureCommitted(outcome)) => {
                        print_outcome(&outcome);
                        break;
                    }
                    Ok(ProbeEvent::PersistenceFailed { ordinal, message }) => {
                        anyhow::bail!("calibration #{} was not saved: {}", ordinal, message);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => return Err(e).context("engine stopped during capture"),
                }
            }
        }
    }
    Ok(())
}

fn print_outcome(outcome: &CaptureOutcome) {
    let entry = &outcome.entry;
    println!(
        "Calibration #{} at {:.2} °C: {}",
        entry.ordinal,
        entry.reference_temperature_c,
        entry
            .raw_values
            .iter()
            .map(|v| format!("{:.2}", v))
            .collect::<Vec<_>>()
            .join(" / ")
    );
    for refit in &outcome.refits {
        match (&refit.coefficients, &refit.error) {
            (Some(c), _) => println!(
                "  channel {:>2}: A={:.12e} B={:.12e} C={:.12e} D={:.12e}{}",
                refit.hardware_channel,
                c.a,
                c.b,
                c.c,
                c.d,
                if refit.from_history { "" } else { " (standard points)" }
            ),
            (None, Some(e)) => println!("  channel {:>2}: refit failed: {}", refit.hardware_channel, e),
            (None, None) => {}
        }
    }
}
