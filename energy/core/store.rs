//! Persistence gateway seam. The relational implementation lives in the
//! `energy-gateway` crate; [`MemoryPredictionStore`] backs tests and
//! store-less runs.

use chrono::NaiveDateTime;
use indexmap::IndexSet;
use parking_lot::Mutex;
use thiserror::Error;

use crate::record::{InteractivePrediction, PredictionRecord};

/// Errors raised by a persistence gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection could not be opened.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Statement failed; the transaction was rolled back.
    #[error("query failed: {0}")]
    Query(String),
    /// Stored row could not be turned back into a record.
    #[error("could not decode stored row: {0}")]
    Decode(String),
    /// Async runtime for the driver could not be created.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Outcome of a best-effort write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    /// Rows written.
    Stored,
    /// Write failed; predictions remain available in memory.
    Failed(String),
}

impl PersistStatus {
    /// `true` on success.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }
}

/// Storage for batch and interactive predictions.
pub trait PredictionStore: Send + Sync {
    /// Deletes every batch prediction, then inserts `records`, atomically.
    /// Returns the number of inserted rows.
    fn replace_batch(&self, records: &[PredictionRecord]) -> Result<usize, StoreError>;

    /// Every batch prediction in insertion order.
    fn load_batch(&self) -> Result<Vec<PredictionRecord>, StoreError>;

    /// Appends one interactive prediction.
    fn append_interactive(&self, prediction: &InteractivePrediction) -> Result<(), StoreError>;

    /// Every interactive prediction in insertion order.
    fn load_interactive(&self) -> Result<Vec<InteractivePrediction>, StoreError>;

    /// Batch predictions of one zone in insertion order.
    fn load_zone(&self, zone: &str) -> Result<Vec<PredictionRecord>, StoreError> {
        Ok(self
            .load_batch()?
            .into_iter()
            .filter(|record| record.zone == zone)
            .collect())
    }

    /// Batch prediction stored under `(timestamp, zone)`.
    fn find(
        &self,
        timestamp: NaiveDateTime,
        zone: &str,
    ) -> Result<Option<PredictionRecord>, StoreError> {
        Ok(self
            .load_zone(zone)?
            .into_iter()
            .find(|record| record.timestamp == timestamp))
    }

    /// Distinct zones in order of first appearance.
    fn zones(&self) -> Result<Vec<String>, StoreError> {
        let zones: IndexSet<String> = self
            .load_batch()?
            .into_iter()
            .map(|record| record.zone)
            .collect();
        Ok(zones.into_iter().collect())
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryPredictionStore {
    batch: Mutex<Vec<PredictionRecord>>,
    interactive: Mutex<Vec<InteractivePrediction>>,
}

impl MemoryPredictionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PredictionStore for MemoryPredictionStore {
    fn replace_batch(&self, records: &[PredictionRecord]) -> Result<usize, StoreError> {
        let mut batch = self.batch.lock();
        batch.clear();
        batch.extend_from_slice(records);
        Ok(records.len())
    }

    fn load_batch(&self) -> Result<Vec<PredictionRecord>, StoreError> {
        Ok(self.batch.lock().clone())
    }

    fn append_interactive(&self, prediction: &InteractivePrediction) -> Result<(), StoreError> {
        self.interactive.lock().push(prediction.clone());
        Ok(())
    }

    fn load_interactive(&self) -> Result<Vec<InteractivePrediction>, StoreError> {
        Ok(self.interactive.lock().clone())
    }
}
