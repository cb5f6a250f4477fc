//! Capture state machine: instant snapshots or time-averaged sessions.
//!
//! An averaging session owns its sampler interval and commit deadline, so
//! dropping the session is what cancels both timers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use super::coefficients::CoefficientTable;
use super::models::{CalibrationLogEntry, CalibrationPoint, CaptureRecord};
use crate::device::{ChannelStore, CHANNEL_COUNT};

/// Cadence of the averaging sampler.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("Reference temperature is required")]
    MissingReference,

    #[error("Reference temperature is not a number: {0:?}")]
    InvalidReference(String),

    #[error("No active channel to capture")]
    NoActiveChannel,

    #[error("Capture duration is out of range: {0:?}")]
    InvalidDuration(Duration),
}

/// Validate operator input for the reference temperature.
pub fn parse_reference(input: &str) -> Result<f64, CaptureError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CaptureError::MissingReference);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(CaptureError::InvalidReference(trimmed.to_string())),
    }
}

/// Accumulator of a running averaging capture.
#[derive(Debug)]
pub struct AveragingSession {
    pub reference_temperature_c: f64,
    pub started_at: DateTime<Utc>,
    pub deadline: Instant,
    per_channel_sum: [f64; CHANNEL_COUNT],
    sample_counts: [u32; CHANNEL_COUNT],
    sampler: Interval,
}

impl AveragingSession {
    fn new(
        reference_temperature_c: f64,
        duration: Duration,
        sample_interval: Duration,
    ) -> Result<Self, CaptureError> {
        let now = Instant::now();
        let deadline = now
            .checked_add(duration)
            .ok_or(CaptureError::InvalidDuration(duration))?;
        let first_sample = now
            .checked_add(sample_interval)
            .filter(|_| !sample_interval.is_zero())
            .ok_or(CaptureError::InvalidDuration(sample_interval))?;

        let mut sampler = interval_at(first_sample, sample_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Self {
            reference_temperature_c,
            started_at: Utc::now(),
            deadline,
            per_channel_sum: [0.0; CHANNEL_COUNT],
            sample_counts: [0; CHANNEL_COUNT],
            sampler,
        })
    }

    /// Add the current raw value of every active channel that has a reading.
    pub fn accumulate(&mut self, channels: &ChannelStore) {
        for (i, channel) in channels.channels().iter().enumerate() {
            if channel.active && channel.raw_value.is_finite() {
                self.per_channel_sum[i] += channel.raw_value;
                self.sample_counts[i] += 1;
            }
        }
    }

    /// Mean per channel; 0 where nothing was sampled.
    pub fn means(&self) -> [f64; CHANNEL_COUNT] {
        self.sampled_means().map(|mean| mean.unwrap_or(0.0))
    }

    /// Mean per channel, `None` for channels without a single sample.
    pub fn sampled_means(&self) -> [Option<f64>; CHANNEL_COUNT] {
        let mut means = [None; CHANNEL_COUNT];
        for (i, mean) in means.iter_mut().enumerate() {
            if self.sample_counts[i] > 0 {
                *mean = Some(self.per_channel_sum[i] / self.sample_counts[i] as f64);
            }
        }
        means
    }

    pub fn sample_counts(&self) -> [u32; CHANNEL_COUNT] {
        self.sample_counts
    }
}

/// What the controller wants the event loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTimer {
    Sample,
    Commit,
}

/// Result of accepting a capture request.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStart {
    /// Duration 0: the record is ready to be appended.
    Instant(CaptureRecord),
    /// Duration > 0: a session is running until `deadline`.
    Averaging { deadline: Instant, replaced_previous: bool },
}

#[derive(Debug)]
pub struct CaptureController {
    session: Option<AveragingSession>,
    sample_interval: Duration,
}

impl CaptureController {
    pub fn new() -> Self {
        Self::with_sample_interval(SAMPLE_INTERVAL)
    }

    pub fn with_sample_interval(sample_interval: Duration) -> Self {
        Self {
            session: None,
            sample_interval,
        }
    }

    /// Start a capture. Validation happens before any state changes; a new
    /// averaging request replaces a running one without merging.
    pub fn request(
        &mut self,
        reference: &str,
        duration: Duration,
        channels: &ChannelStore,
        coefficients: &CoefficientTable,
        next_ordinal: u32,
    ) -> Result<CaptureStart, CaptureError> {
        let reference_temperature_c = parse_reference(reference)?;
        if !channels.any_active() {
            return Err(CaptureError::NoActiveChannel);
        }

        if duration.is_zero() {
            let mut values = [None; CHANNEL_COUNT];
            for (value, channel) in values.iter_mut().zip(channels.channels()) {
                *value = channel.has_reading().then_some(channel.raw_value);
            }
            let record = build_record(
                reference_temperature_c,
                values,
                channels,
                coefficients,
                next_ordinal,
                Utc::now(),
            );
            log::info!(
                "Instant capture #{} at {:.2} °C",
                record.entry.ordinal,
                reference_temperature_c
            );
            return Ok(CaptureStart::Instant(record));
        }

        let session = AveragingSession::new(reference_temperature_c, duration, self.sample_interval)?;
        let replaced_previous = self.cancel();
        let deadline = session.deadline;
        self.session = Some(session);
        log::info!(
            "Averaging capture started: {:.2} °C for {:?}{}",
            reference_temperature_c,
            duration,
            if replaced_previous { " (previous session discarded)" } else { "" }
        );
        Ok(CaptureStart::Averaging { deadline, replaced_previous })
    }

    /// Resolves when the running session needs a sample or a commit; never
    /// resolves while idle. A sample due at the deadline is taken first.
    pub async fn next_timer(&mut self) -> CaptureTimer {
        match self.session.as_mut() {
            Some(session) => {
                let deadline = session.deadline;
                tokio::select! {
                    biased;
                    _ = session.sampler.tick() => CaptureTimer::Sample,
                    _ = sleep_until(deadline) => CaptureTimer::Commit,
                }
            }
            None => std::future::pending().await,
        }
    }

    pub fn sample(&mut self, channels: &ChannelStore) -> bool {
        match self.session.as_mut() {
            Some(session) => {
                session.accumulate(channels);
                true
            }
            None => false,
        }
    }

    /// End the running session and build its record from the means.
    pub fn commit(
        &mut self,
        channels: &ChannelStore,
        coefficients: &CoefficientTable,
        next_ordinal: u32,
    ) -> Option<CaptureRecord> {
        let session = self.session.take()?;
        let record = build_record(
            session.reference_temperature_c,
            session.sampled_means(),
            channels,
            coefficients,
            next_ordinal,
            Utc::now(),
        );
        log::info!(
            "Averaging capture #{} committed with {:?} samples",
            record.entry.ordinal,
            session.sample_counts()
        );
        Some(record)
    }

    /// Drop the running session, timers included. Returns whether one existed.
    pub fn cancel(&mut self) -> bool {
        self.session.take().is_some()
    }

    pub fn is_averaging(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&AveragingSession> {
        self.session.as_ref()
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared by the instant and averaged paths. Only channels that are active
/// now and have a value are recorded and get a marker; the rest store 0.
fn build_record(
    reference_temperature_c: f64,
    values: [Option<f64>; CHANNEL_COUNT],
    channels: &ChannelStore,
    coefficients: &CoefficientTable,
    ordinal: u32,
    timestamp: DateTime<Utc>,
) -> CaptureRecord {
    let mut raw_values = [0.0; CHANNEL_COUNT];
    let mut points = Vec::new();
    let mut captured = Vec::new();

    for (i, channel) in channels.channels().iter().enumerate() {
        let raw = match values[i] {
            Some(raw) if channel.active && raw.is_finite() => raw,
            _ => continue,
        };
        raw_values[i] = raw;
        captured.push(channel.logical_id);
        points.push(CalibrationPoint {
            timestamp,
            temperature_c: coefficients.convert(channel.hardware_channel, raw),
            reference_temperature_c,
            channel_id: channel.hardware_channel,
            raw_value: raw,
            label: channel.label.clone(),
        });
    }

    CaptureRecord {
        entry: CalibrationLogEntry {
            ordinal,
            timestamp,
            reference_temperature_c,
            raw_values,
        },
        points,
        channels: captured,
    }
}
