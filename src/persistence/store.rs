use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;

use super::models::{LogEntryCreate, LogEntryResponse, PersistenceError, PersistenceResult};
use crate::calibration::{CalibrationCoefficients, CalibrationLogEntry};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where calibration log entries live between sessions.
#[async_trait::async_trait]
pub trait CalibrationStore: Send + Sync {
    /// Full log, oldest first.
    async fn fetch_log(&self) -> PersistenceResult<Vec<CalibrationLogEntry>>;

    async fn append_log(&self, entry: &CalibrationLogEntry) -> PersistenceResult<()>;

    /// Stored coefficients per hardware channel, `None` when the store has none.
    async fn fetch_coefficients(&self) -> PersistenceResult<Option<BTreeMap<u32, CalibrationCoefficients>>>;
}

/// Client for the calibration project HTTP API.
pub struct HttpCalibrationStore {
    client: Client,
    base_url: String,
    calibration_id: String,
}

impl HttpCalibrationStore {
    pub fn new(base_url: &str, calibration_id: impl Into<String>) -> PersistenceResult<Self> {
        Self::with_timeout(base_url, calibration_id, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Every request, connect included, fails after `timeout`.
    pub fn with_timeout(
        base_url: &str,
        calibration_id: impl Into<String>,
        timeout: Duration,
    ) -> PersistenceResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            calibration_id: calibration_id.into(),
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/calibrations/{}/{}", self.base_url, self.calibration_id, resource)
    }

    async fn status_error(response: reqwest::Response) -> PersistenceError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        PersistenceError::Status { status, body }
    }
}

#[async_trait::async_trait]
impl CalibrationStore for HttpCalibrationStore {
    async fn fetch_log(&self) -> PersistenceResult<Vec<CalibrationLogEntry>> {
        let url = self.url("log");
        debug!("Fetching calibration log from: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            error!("Calibration log request failed with status: {}", response.status());
            return Err(Self::status_error(response).await);
        }

        let rows: Vec<LogEntryResponse> = response.json().await?;
        info!("Fetched {} calibration log entries", rows.len());
        Ok(rows.into_iter().map(CalibrationLogEntry::from).collect())
    }

    async fn append_log(&self, entry: &CalibrationLogEntry) -> PersistenceResult<()> {
        let url = self.url("log");
        let body = LogEntryCreate::from(entry);
        debug!("Appending calibration #{} to {}", entry.ordinal, url);

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            error!("Calibration log append failed with status: {}", response.status());
            return Err(Self::status_error(response).await);
        }

        // the server echoes the stored row; make sure it is the one we sent
        let echoed: LogEntryResponse = response.json().await?;
        if echoed.calibration_number != entry.ordinal {
            return Err(PersistenceError::Rejected(format!(
                "server stored #{} instead of #{}",
                echoed.calibration_number, entry.ordinal
            )));
        }
        Ok(())
    }

    async fn fetch_coefficients(&self) -> PersistenceResult<Option<BTreeMap<u32, CalibrationCoefficients>>> {
        let url = self.url("coeffs");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("No stored coefficients at {}", url);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let raw: BTreeMap<String, CalibrationCoefficients> = response.json().await?;
        let mut table = BTreeMap::new();
        for (key, coeffs) in raw {
            match key.trim().parse::<u32>() {
                Ok(channel) if coeffs.is_finite() => {
                    table.insert(channel, coeffs);
                }
                _ => warn!("Ignoring stored coefficients for channel {:?}", key),
            }
        }
        Ok(Some(table))
    }
}

/// In-process store used for offline sessions and tests.
#[derive(Default)]
pub struct MemoryCalibrationStore {
    entries: Mutex<Vec<CalibrationLogEntry>>,
    coefficients: Mutex<Option<BTreeMap<u32, CalibrationCoefficients>>>,
    fail_appends: AtomicBool,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<CalibrationLogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Self::default()
        }
    }

    pub async fn set_coefficients(&self, coefficients: BTreeMap<u32, CalibrationCoefficients>) {
        *self.coefficients.lock().await = Some(coefficients);
    }

    /// Make subsequent appends fail, as a rejecting server would.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<CalibrationLogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl CalibrationStore for MemoryCalibrationStore {
    async fn fetch_log(&self) -> PersistenceResult<Vec<CalibrationLogEntry>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn append_log(&self, entry: &CalibrationLogEntry) -> PersistenceResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(PersistenceError::Rejected("store is refusing appends".to_string()));
        }
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn fetch_coefficients(&self) -> PersistenceResult<Option<BTreeMap<u32, CalibrationCoefficients>>> {
        Ok(self.coefficients.lock().await.clone())
    }
}
