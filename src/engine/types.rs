use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use super::Result;
use crate::calibration::{CalibrationCoefficients, CalibrationLogEntry, CalibrationPoint, PointSource};
use crate::device::ChannelState;
use crate::serial::SerialInterface;
use crate::telemetry::TelemetrySample;

/// Requests handled by the engine task, one at a time.
pub enum ProbeCommand {
    SetChannelActive { logical_id: u8, active: bool, responder: oneshot::Sender<Result<()>> },
    Capture { reference: String, duration: Duration, responder: oneshot::Sender<Result<CaptureAck>> },
    CancelCapture { responder: oneshot::Sender<bool> },
    /// Replace the transport after a connection loss.
    Attach { interface: SerialInterface, responder: oneshot::Sender<Result<()>> },
    Shutdown { responder: oneshot::Sender<()> },
}

/// Reply to a capture request.
#[derive(Debug, Clone, Serialize)]
pub enum CaptureAck {
    /// Instant capture, already appended, persisted and refit.
    Committed(CaptureOutcome),
    /// Averaging session started; the result arrives as `ProbeEvent::CaptureCommitted`.
    Averaging { duration: Duration, replaced_previous: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub entry: CalibrationLogEntry,
    pub points: Vec<CalibrationPoint>,
    pub refits: Vec<RefitReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefitReport {
    pub logical_id: u8,
    pub hardware_channel: u32,
    pub coefficients: Option<CalibrationCoefficients>,
    pub from_history: bool,
    pub error: Option<String>,
}

impl RefitReport {
    pub fn fitted(logical_id: u8, hardware_channel: u32, coefficients: CalibrationCoefficients, source: PointSource) -> Self {
        Self {
            logical_id,
            hardware_channel,
            coefficients: Some(coefficients),
            from_history: source == PointSource::History,
            error: None,
        }
    }

    pub fn failed(logical_id: u8, hardware_channel: u32, error: String) -> Self {
        Self { logical_id, hardware_channel, coefficients: None, from_history: false, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum ProbeEvent {
    Telemetry(TelemetrySample),
    CaptureStarted { reference_temperature_c: f64, duration: Duration },
    CaptureCancelled,
    CaptureCommitted(CaptureOutcome),
    RefitFailed { hardware_channel: u32, message: String },
    /// The entry stays in the local log even though the store rejected it.
    PersistenceFailed { ordinal: u32, message: String },
    TransportNotice { message: String },
}

/// Read-only view of the engine state, republished after every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeSnapshot {
    pub channels: Vec<ChannelState>,
    pub coefficients: BTreeMap<u32, CalibrationCoefficients>,
    pub log: Arc<Vec<CalibrationLogEntry>>,
    pub markers: Arc<Vec<CalibrationPoint>>,
    pub telemetry: Arc<Vec<TelemetrySample>>,
    pub averaging: bool,
    pub connected: bool,
    pub seq: u64,
}

impl ProbeSnapshot {
    pub fn channel(&self, logical_id: u8) -> Option<&ChannelState> {
        self.channels.iter().find(|c| c.logical_id == logical_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub lines_read: u64,
    pub boot_noise_lines: u64,
    pub skipped_tokens: u64,
    pub partial_buffer_trims: u64,
    pub captures_committed: u64,
    pub refit_failures: u64,
    pub persistence_failures: u64,
    pub transport_errors: u64,
    pub last_error: Option<String>,
}
