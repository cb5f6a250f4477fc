use std::collections::VecDeque;

use serde::Serialize;

use super::models::{CalibrationLogEntry, CalibrationPoint, CaptureRecord};

pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Fixed capacity FIFO; pushing past capacity evicts the oldest item.
#[derive(Debug, Clone, Serialize)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }
}

impl<T: Clone> BoundedBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Calibration log plus the marker buffer shown alongside telemetry.
#[derive(Debug, Clone)]
pub struct CalibrationHistory {
    entries: Vec<CalibrationLogEntry>,
    markers: BoundedBuffer<CalibrationPoint>,
}

impl CalibrationHistory {
    pub fn new(marker_capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            markers: BoundedBuffer::new(marker_capacity),
        }
    }

    /// Replace the log with entries loaded from the store.
    pub fn load(&mut self, mut entries: Vec<CalibrationLogEntry>) {
        entries.sort_by_key(|e| e.ordinal);
        log::info!("Loaded {} calibration log entries", entries.len());
        self.entries = entries;
    }

    pub fn next_ordinal(&self) -> u32 {
        self.entries.len() as u32 + 1
    }

    pub fn append(&mut self, record: &CaptureRecord) {
        self.entries.push(record.entry.clone());
        for point in &record.points {
            self.markers.push(point.clone());
        }
    }

    pub fn entries(&self) -> &[CalibrationLogEntry] {
        &self.entries
    }

    pub fn markers(&self) -> &BoundedBuffer<CalibrationPoint> {
        &self.markers
    }
}

impl Default for CalibrationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
