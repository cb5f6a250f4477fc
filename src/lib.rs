pub mod calibration;
pub mod config;
pub mod device;
pub mod engine;
pub mod export;
pub mod persistence;
pub mod serial;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Context;

use config::AppSettings;
use engine::{ProbeEngineBuilder, ProbeHandle};
use persistence::{CalibrationStore, HttpCalibrationStore, MemoryCalibrationStore};
use serial::SerialInterface;

/// Install the log backend. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init();
}

/// Calibration log backend for these settings.
pub fn build_store(settings: &AppSettings, offline: bool) -> anyhow::Result<Arc<dyn CalibrationStore>> {
    if offline {
        log::info!("Offline mode: calibration log kept in memory");
        return Ok(Arc::new(MemoryCalibrationStore::new()));
    }
    let calibration_id = settings
        .calibration_id
        .context("calibration_id is required unless running offline")?;
    let store = HttpCalibrationStore::with_timeout(
        &settings.api_base_url,
        calibration_id.to_string(),
        settings.api_timeout(),
    )
    .context("failed to build HTTP client")?;
    Ok(Arc::new(store))
}

/// Open the configured port and start the probe engine on it.
pub async fn start_session(settings: AppSettings, store: Arc<dyn CalibrationStore>) -> anyhow::Result<ProbeHandle> {
    settings.validate()?;
    let port_name = settings
        .port_name
        .clone()
        .context("no serial port configured (use --port)")?;

    let mut interface = SerialInterface::new();
    interface
        .connect_with_baud(&port_name, settings.baud_rate)
        .with_context(|| format!("failed to open {}", port_name))?;

    let handle = ProbeEngineBuilder::new(interface, settings, store)
        .start()
        .await
        .context("failed to start probe engine")?;

    log::info!("Probe session started on {}", port_name);
    Ok(handle)
}
