//! Probe engine task: one cooperative loop owning the transport, the
//! channel store and the calibration state.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};

use super::types::*;
use super::{EngineError, Result};
use crate::calibration::{
    refit_channel, BoundedBuffer, CalibrationHistory, CalibrationLogEntry, CalibrationPoint, CaptureController,
    CaptureRecord, CaptureStart, CaptureTimer, CoefficientTable,
};
use crate::config::AppSettings;
use crate::device::ChannelStore;
use crate::persistence::{CalibrationStore, PersistenceError, PersistenceResult};
use crate::serial::{LineFramer, ProbeProtocol, SerialInterface};
use crate::telemetry::{parse_line, TelemetrySample};

const READ_BUFFER_SIZE: usize = 512;

type SaveResult = (CaptureRecord, PersistenceResult<()>);
type CaptureResponder = oneshot::Sender<Result<CaptureAck>>;

#[derive(Clone)]
pub struct ProbeHandle {
    cmd_tx: mpsc::Sender<ProbeCommand>,
    events_tx: broadcast::Sender<ProbeEvent>,
    snapshot_rx: watch::Receiver<Arc<ProbeSnapshot>>,
    metrics_rx: watch::Receiver<EngineMetrics>,
}

impl ProbeHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot_receiver(&self) -> watch::Receiver<Arc<ProbeSnapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> Arc<ProbeSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<EngineMetrics> {
        self.metrics_rx.clone()
    }

    /// Activate or deactivate a logical channel (1..=4).
    pub async fn set_channel_active(&self, logical_id: u8, active: bool) -> Result<()> {
        self.request(|responder| ProbeCommand::SetChannelActive { logical_id, active, responder })
            .await?
    }

    /// Capture a calibration point. `Duration::ZERO` snapshots immediately,
    /// anything longer averages over that window.
    pub async fn capture(&self, reference: &str, duration: Duration) -> Result<CaptureAck> {
        let reference = reference.to_string();
        self.request(|responder| ProbeCommand::Capture { reference, duration, responder })
            .await?
    }

    /// Abort a running averaging capture. Returns whether one was running.
    pub async fn cancel_capture(&self) -> Result<bool> {
        self.request(|responder| ProbeCommand::CancelCapture { responder }).await
    }

    /// Hand the engine a freshly opened transport.
    pub async fn attach(&self, interface: SerialInterface) -> Result<()> {
        self.request(|responder| ProbeCommand::Attach { interface, responder }).await?
    }

    /// Stop timers, close the transport and end the engine task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| ProbeCommand::Shutdown { responder }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ProbeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(build(tx)).await.map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

pub struct ProbeEngineBuilder {
    pub interface: SerialInterface,
    pub settings: AppSettings,
    pub store: Arc<dyn CalibrationStore>,
    pub event_capacity: usize,
    pub command_capacity: usize,
}

impl ProbeEngineBuilder {
    pub fn new(interface: SerialInterface, settings: AppSettings, store: Arc<dyn CalibrationStore>) -> Self {
        Self {
            interface,
            settings,
            store,
            event_capacity: 256,
            command_capacity: 64,
        }
    }

    /// Load the calibration log, send the start command and spawn the engine task.
    pub async fn start(self) -> Result<ProbeHandle> {
        if let Err(e) = self.settings.validate() {
            let mut interface = self.interface;
            interface.disconnect().await;
            return Err(e.into());
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_capacity);
        let (events_tx, _events_rx) = broadcast::channel(self.event_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(ProbeSnapshot::default()));
        let (metrics_tx, metrics_rx) = watch::channel(EngineMetrics::default());

        let settings = self.settings;
        let mut engine = ProbeEngine {
            interface: self.interface,
            framer: LineFramer::with_noise_prefixes(settings.boot_noise_prefixes.clone()),
            channels: ChannelStore::new(settings.hardware_channel_offset, &settings.channel_labels),
            coefficients: CoefficientTable::new(),
            history: CalibrationHistory::new(settings.history_capacity),
            telemetry: BoundedBuffer::new(settings.history_capacity),
            controller: CaptureController::with_sample_interval(settings.sample_interval()),
            store: self.store,
            saves: JoinSet::new(),
            pending_acks: BTreeMap::new(),
            log_view: Arc::default(),
            markers_view: Arc::default(),
            telemetry_view: Arc::default(),
            settings,
            events_tx: events_tx.clone(),
            snapshot_tx,
            metrics_tx,
            metrics: EngineMetrics::default(),
            seq: 0,
        };

        engine.load_calibration().await;
        if engine.interface.is_connected() {
            if let Err(e) = engine.send_start_command().await {
                engine.interface.disconnect().await;
                return Err(e);
            }
        }
        engine.publish_snapshot();

        tokio::spawn(engine.run(cmd_rx));

        Ok(ProbeHandle { cmd_tx, events_tx, snapshot_rx, metrics_rx })
    }
}

struct ProbeEngine {
    interface: SerialInterface,
    framer: LineFramer,
    channels: ChannelStore,
    coefficients: CoefficientTable,
    history: CalibrationHistory,
    telemetry: BoundedBuffer<TelemetrySample>,
    controller: CaptureController,
    store: Arc<dyn CalibrationStore>,
    /// Log appends in flight; the loop keeps running while the store is slow.
    saves: JoinSet<SaveResult>,
    /// Instant captures answered once their entry is saved, by ordinal.
    pending_acks: BTreeMap<u32, CaptureResponder>,
    log_view: Arc<Vec<CalibrationLogEntry>>,
    markers_view: Arc<Vec<CalibrationPoint>>,
    telemetry_view: Arc<Vec<TelemetrySample>>,
    settings: AppSettings,
    events_tx: broadcast::Sender<ProbeEvent>,
    snapshot_tx: watch::Sender<Arc<ProbeSnapshot>>,
    metrics_tx: watch::Sender<EngineMetrics>,
    metrics: EngineMetrics,
    seq: u64,
}

impl ProbeEngine {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ProbeCommand>) {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let connected = self.interface.is_connected();
            let saving = !self.saves.is_empty();
            tokio::select! {
                biased;
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                return;
                            }
                        }
                        None => break,
                    }
                },
                Some(joined) = self.saves.join_next(), if saving => {
                    self.handle_saved(joined);
                },
                read_res = self.interface.read_chunk(&mut buf), if connected => {
                    match read_res {
                        Ok(0) => self.transport_lost("serial port closed by device".to_string()).await,
                        Ok(n) => self.handle_chunk(&buf[..n]),
                        Err(e) => self.transport_lost(format!("serial read failed: {}", e)).await,
                    }
                },
                timer = self.controller.next_timer() => self.handle_timer(timer),
            }
        }

        self.shutdown().await;
    }

    /// Frame, parse and apply one chunk; the channel store is updated line
    /// by line before anything else can observe it.
    fn handle_chunk(&mut self, chunk: &[u8]) {
        let framed = self.framer.feed(chunk);
        let mut sampled = false;
        self.metrics.boot_noise_lines += framed.boot_noise as u64;
        if framed.trimmed {
            self.metrics.partial_buffer_trims += 1;
        }

        for line in &framed.lines {
            self.metrics.lines_read += 1;
            let parsed = parse_line(line);
            self.metrics.skipped_tokens += parsed.skipped_tokens as u64;

            let updated = self.channels.apply(&parsed.readings, &self.coefficients);
            if updated > 0 {
                let sample = TelemetrySample {
                    timestamp: chrono::Utc::now(),
                    temperatures: self.channels.temperatures(),
                };
                self.telemetry.push(sample.clone());
                sampled = true;
                let _ = self.events_tx.send(ProbeEvent::Telemetry(sample));
            }
        }
        if sampled {
            self.telemetry_view = Arc::new(self.telemetry.to_vec());
        }

        let _ = self.metrics_tx.send_replace(self.metrics.clone());
        if !framed.lines.is_empty() {
            self.publish_snapshot();
        }
    }

    /// Returns false once the engine has shut down.
    async fn handle_command(&mut self, cmd: ProbeCommand) -> bool {
        match cmd {
            ProbeCommand::SetChannelActive { logical_id, active, responder } => {
                let result = self.set_channel_active(logical_id, active).await;
                let _ = responder.send(result);
            }
            ProbeCommand::Capture { reference, duration, responder } => {
                self.start_capture(&reference, duration, responder);
            }
            ProbeCommand::CancelCapture { responder } => {
                let cancelled = self.controller.cancel();
                if cancelled {
                    log::info!("Averaging capture cancelled");
                    let _ = self.events_tx.send(ProbeEvent::CaptureCancelled);
                    self.publish_snapshot();
                }
                let _ = responder.send(cancelled);
            }
            ProbeCommand::Attach { interface, responder } => {
                self.interface.disconnect().await;
                self.interface = interface;
                self.framer.reset();
                let result = self.send_start_command().await;
                self.publish_snapshot();
                let _ = responder.send(result);
            }
            ProbeCommand::Shutdown { responder } => {
                self.shutdown().await;
                let _ = responder.send(());
                return false;
            }
        }
        true
    }

    fn handle_timer(&mut self, timer: CaptureTimer) {
        match timer {
            CaptureTimer::Sample => {
                self.controller.sample(&self.channels);
            }
            CaptureTimer::Commit => {
                let next = self.history.next_ordinal();
                if let Some(record) = self.controller.commit(&self.channels, &self.coefficients, next) {
                    self.begin_save(record);
                }
            }
        }
    }

    async fn set_channel_active(&mut self, logical_id: u8, active: bool) -> Result<()> {
        let changed = self.channels.set_active(logical_id, active)?;
        self.publish_snapshot();
        if !changed {
            return Ok(());
        }
        log::info!("Channel {} {}", logical_id, if active { "activated" } else { "deactivated" });

        if !self.interface.is_connected() {
            log::debug!("Not connected, toggle command not sent");
            return Ok(());
        }
        let command = ProbeProtocol::toggle_command(&self.channels.active_hardware_channels());
        if let Err(e) = self.interface.send_command(&command).await {
            self.note_error(format!("toggle command failed: {}", e));
            return Err(e.into());
        }
        Ok(())
    }

    /// Instant captures are answered after the store call finishes, averaging
    /// requests as soon as the session is running.
    fn start_capture(&mut self, reference: &str, duration: Duration, responder: CaptureResponder) {
        let next = self.history.next_ordinal();
        let start = match self
            .controller
            .request(reference, duration, &self.channels, &self.coefficients, next)
        {
            Ok(start) => start,
            Err(e) => {
                let _ = responder.send(Err(e.into()));
                return;
            }
        };

        match start {
            CaptureStart::Instant(record) => {
                self.pending_acks.insert(record.entry.ordinal, responder);
                self.begin_save(record);
            }
            CaptureStart::Averaging { replaced_previous, .. } => {
                if replaced_previous {
                    let _ = self.events_tx.send(ProbeEvent::CaptureCancelled);
                }
                let reference_temperature_c = self
                    .controller
                    .session()
                    .map(|s| s.reference_temperature_c)
                    .unwrap_or_default();
                let _ = self.events_tx.send(ProbeEvent::CaptureStarted { reference_temperature_c, duration });
                self.publish_snapshot();
                let _ = responder.send(Ok(CaptureAck::Averaging { duration, replaced_previous }));
            }
        }
    }

    /// Append locally and hand the entry to the store in the background.
    fn begin_save(&mut self, record: CaptureRecord) {
        self.history.append(&record);
        self.refresh_history_views();
        self.publish_snapshot();

        let store = self.store.clone();
        self.saves.spawn(async move {
            let result = store.append_log(&record.entry).await;
            (record, result)
        });
    }

    fn handle_saved(&mut self, joined: std::result::Result<SaveResult, JoinError>) {
        let (record, result) = match joined {
            Ok(saved) => saved,
            Err(e) => {
                self.metrics.persistence_failures += 1;
                self.note_error(format!("calibration save task failed: {}", e));
                if self.saves.is_empty() {
                    // nothing left that could answer them
                    for (_, responder) in std::mem::take(&mut self.pending_acks) {
                        let _ = responder.send(Err(PersistenceError::Rejected(e.to_string()).into()));
                    }
                }
                return;
            }
        };

        let responder = self.pending_acks.remove(&record.entry.ordinal);
        let outcome = self.complete_capture(record, result);
        if let Some(responder) = responder {
            let _ = responder.send(outcome.map(CaptureAck::Committed));
        }
    }

    /// Refit every captured channel once the store accepted the entry.
    ///
    /// The local log is not rolled back when persisting fails, and no refit
    /// happens in that case.
    fn complete_capture(&mut self, record: CaptureRecord, saved: PersistenceResult<()>) -> Result<CaptureOutcome> {
        if let Err(e) = saved {
            self.metrics.persistence_failures += 1;
            self.note_error(format!("calibration #{} not persisted: {}", record.entry.ordinal, e));
            let _ = self.events_tx.send(ProbeEvent::PersistenceFailed {
                ordinal: record.entry.ordinal,
                message: e.to_string(),
            });
            return Err(e.into());
        }

        let mut refits = Vec::new();
        for logical_id in &record.channels {
            refits.push(self.refit(*logical_id));
        }
        self.channels.recompute(&self.coefficients);

        self.metrics.captures_committed += 1;
        let _ = self.metrics_tx.send_replace(self.metrics.clone());

        let outcome = CaptureOutcome {
            entry: record.entry,
            points: record.points,
            refits,
        };
        let _ = self.events_tx.send(ProbeEvent::CaptureCommitted(outcome.clone()));
        self.publish_snapshot();
        Ok(outcome)
    }

    /// Refit one channel from the log. On failure the old coefficients stay.
    fn refit(&mut self, logical_id: u8) -> RefitReport {
        let Some(hardware_channel) = self.channels.get(logical_id).map(|c| c.hardware_channel) else {
            return RefitReport::failed(logical_id, 0, "unknown channel".to_string());
        };
        let index = logical_id as usize - 1;

        match refit_channel(self.history.entries(), index) {
            Ok((coefficients, source)) => {
                log::info!("Channel {} refit ({:?} points): {:?}", hardware_channel, source, coefficients);
                self.coefficients.replace(hardware_channel, coefficients);
                RefitReport::fitted(logical_id, hardware_channel, coefficients, source)
            }
            Err(e) => {
                log::warn!("Refit of channel {} failed, keeping previous coefficients: {}", hardware_channel, e);
                self.metrics.refit_failures += 1;
                let _ = self.events_tx.send(ProbeEvent::RefitFailed {
                    hardware_channel,
                    message: e.to_string(),
                });
                RefitReport::failed(logical_id, hardware_channel, e.to_string())
            }
        }
    }

    /// Initial log and coefficients. Missing or partial stored coefficients
    /// are filled in by a local fit.
    async fn load_calibration(&mut self) {
        match self.store.fetch_log().await {
            Ok(entries) => self.history.load(entries),
            Err(e) => self.note_error(format!("could not load calibration log: {}", e)),
        }
        self.refresh_history_views();

        let stored = match self.store.fetch_coefficients().await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                log::warn!("Could not load stored coefficients, fitting locally: {}", e);
                Default::default()
            }
        };

        for logical_id in 1..=self.channels.channels().len() as u8 {
            let Some(hardware_channel) = self.channels.get(logical_id).map(|c| c.hardware_channel) else {
                continue;
            };
            match stored.get(&hardware_channel) {
                Some(coefficients) => self.coefficients.replace(hardware_channel, *coefficients),
                None => {
                    self.refit(logical_id);
                }
            }
        }
        self.channels.recompute(&self.coefficients);
    }

    async fn send_start_command(&mut self) -> Result<()> {
        let command = ProbeProtocol::start_command(&self.channels.hardware_channels(), &self.settings.acquisition);
        self.interface.send_command(&command).await?;
        // the device starts with every channel enabled
        if self.channels.active_hardware_channels().len() != self.channels.channels().len() {
            let toggle = ProbeProtocol::toggle_command(&self.channels.active_hardware_channels());
            self.interface.send_command(&toggle).await?;
        }
        Ok(())
    }

    async fn transport_lost(&mut self, message: String) {
        self.metrics.transport_errors += 1;
        self.note_error(message.clone());
        let _ = self.events_tx.send(ProbeEvent::TransportNotice { message });
        self.interface.disconnect().await;
        self.framer.reset();
        self.publish_snapshot();
    }

    /// Timers go first, then pending saves, then the port.
    async fn shutdown(&mut self) {
        if self.controller.cancel() {
            log::info!("Averaging capture discarded on shutdown");
        }
        if !self.saves.is_empty() {
            log::warn!("Abandoning {} unsaved calibration entries", self.saves.len());
            self.saves.abort_all();
        }
        self.pending_acks.clear();
        self.interface.disconnect().await;
        self.publish_snapshot();
        log::info!("Probe engine stopped");
    }

    fn note_error(&mut self, message: String) {
        log::warn!("{}", message);
        self.metrics.last_error = Some(message);
        let _ = self.metrics_tx.send_replace(self.metrics.clone());
    }

    /// Log and markers are shared between snapshots until they change.
    fn refresh_history_views(&mut self) {
        self.log_view = Arc::new(self.history.entries().to_vec());
        self.markers_view = Arc::new(self.history.markers().to_vec());
    }

    fn publish_snapshot(&mut self) {
        self.seq += 1;
        let coefficients = self
            .channels
            .hardware_channels()
            .into_iter()
            .map(|hw| (hw, self.coefficients.get(hw)))
            .collect();
        let snapshot = ProbeSnapshot {
            channels: self.channels.channels().to_vec(),
            coefficients,
            log: self.log_view.clone(),
            markers: self.markers_view.clone(),
            telemetry: self.telemetry_view.clone(),
            averaging: self.controller.is_averaging(),
            connected: self.interface.is_connected(),
            seq: self.seq,
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
