//! Batch run: load, encode, fit, predict, persist, aggregate.

use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    aggregation::{annotate, OlapParams, OlapReport},
    config::EnergyConfig,
    engine::Evaluation,
    lifecycle::ModelLifecycle,
    record::PredictionRecord,
    store::{PersistStatus, PredictionStore},
    telemetry::{EnergyTelemetry, EVENT_BATCH_PERSISTED, EVENT_BATCH_PERSIST_FAILED},
};

/// Everything a batch run produced. Predictions are kept even when the
/// store write failed.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// Identifier of the fitted model.
    pub model_id: Uuid,
    /// Records read from the input file.
    pub rows: usize,
    /// Holdout diagnostics.
    pub evaluation: Evaluation,
    /// `true` when the model artifact was refreshed.
    pub artifact_saved: bool,
    /// Store result for `energy_predictions`.
    pub persisted: PersistStatus,
    /// One prediction per input record, in input order.
    pub predictions: Vec<PredictionRecord>,
    /// Views over the predictions.
    pub olap: OlapReport,
}

/// Sequential batch pipeline over one configuration and one store.
pub struct BatchPipeline {
    config: EnergyConfig,
    store: Arc<dyn PredictionStore>,
    telemetry: Option<EnergyTelemetry>,
}

impl fmt::Debug for BatchPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchPipeline")
            .field("csv_path", &self.config.data.csv_path)
            .field("zone", &self.config.data.zone)
            .finish_non_exhaustive()
    }
}

impl BatchPipeline {
    /// Creates a pipeline writing to `store`.
    #[must_use]
    pub fn new(config: EnergyConfig, store: Arc<dyn PredictionStore>) -> Self {
        Self {
            config,
            store,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EnergyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Sets telemetry after construction.
    pub fn set_telemetry(&mut self, telemetry: EnergyTelemetry) {
        self.telemetry = Some(telemetry);
    }

    /// Runs the pipeline. Input, encoding and fitting errors abort the run;
    /// a failed store write is reported in [`BatchReport::persisted`].
    pub fn run(&self) -> Result<BatchReport> {
        let run_id = Uuid::new_v4();
        self.log(
            LogLevel::Info,
            "energy.batch.start",
            json!({ "run_id": run_id, "input": self.config.data.csv_path }),
        );

        let mut lifecycle = ModelLifecycle::new(&self.config)?;
        if let Some(tel) = &self.telemetry {
            lifecycle = lifecycle.with_telemetry(tel.clone());
        }
        let run = lifecycle.train_and_store()?;
        let predicted = run
            .model
            .predict(&run.batch.features)
            .context("predicting historical records")?;
        let zone = &self.config.data.zone;
        let predictions: Vec<PredictionRecord> = run
            .batch
            .timestamps
            .iter()
            .zip(predicted)
            .map(|(timestamp, value)| PredictionRecord::new(*timestamp, zone.as_str(), value))
            .collect();

        let persisted = match self.store.replace_batch(&predictions) {
            Ok(inserted) => {
                self.log(
                    LogLevel::Info,
                    EVENT_BATCH_PERSISTED,
                    json!({ "run_id": run_id, "rows": inserted }),
                );
                self.event(
                    EVENT_BATCH_PERSISTED,
                    json!({ "run_id": run_id, "rows": inserted, "zone": zone }),
                );
                PersistStatus::Stored
            }
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    EVENT_BATCH_PERSIST_FAILED,
                    json!({ "run_id": run_id, "error": err.to_string() }),
                );
                self.event(
                    EVENT_BATCH_PERSIST_FAILED,
                    json!({ "run_id": run_id, "error": err.to_string() }),
                );
                PersistStatus::Failed(err.to_string())
            }
        };

        let olap = OlapReport::build(&annotate(&predictions), &self.config.olap);
        self.log(
            LogLevel::Info,
            "energy.batch.completed",
            json!({
                "run_id": run_id,
                "rows": predictions.len(),
                "stored": persisted.is_stored(),
                "holdout_mae": run.model.evaluation().holdout_mae,
            }),
        );

        Ok(BatchReport {
            run_id,
            model_id: run.model.id(),
            rows: run.batch.len(),
            evaluation: run.model.evaluation().clone(),
            artifact_saved: run.artifact_saved,
            persisted,
            predictions,
            olap,
        })
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload);
        }
    }
}

/// Views over the batch predictions currently held by `store`.
pub fn olap_from_store(store: &dyn PredictionStore, params: &OlapParams) -> Result<OlapReport> {
    let records = store.load_batch().context("loading batch predictions")?;
    Ok(OlapReport::build(&annotate(&records), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lifecycle::tests::small_config,
        record::InteractivePrediction,
        store::{MemoryPredictionStore, StoreError},
        telemetry::{EVENT_BATCH_LOADED, EVENT_BATCH_TRAINED},
    };
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    struct OfflineStore;

    impl PredictionStore for OfflineStore {
        fn replace_batch(&self, _: &[PredictionRecord]) -> Result<usize, StoreError> {
            Err(StoreError::Connection("database is offline".into()))
        }

        fn load_batch(&self) -> Result<Vec<PredictionRecord>, StoreError> {
            Err(StoreError::Connection("database is offline".into()))
        }

        fn append_interactive(&self, _: &InteractivePrediction) -> Result<(), StoreError> {
            Err(StoreError::Connection("database is offline".into()))
        }

        fn load_interactive(&self) -> Result<Vec<InteractivePrediction>, StoreError> {
            Err(StoreError::Connection("database is offline".into()))
        }
    }

    #[test]
    fn batch_run_predicts_persists_and_aggregates() {
        let dir = tempdir().unwrap();
        let config = small_config(&dir, 72);
        let store = Arc::new(MemoryPredictionStore::new());
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = EnergyTelemetry::builder("energy")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let report = BatchPipeline::new(config, store.clone())
            .with_telemetry(telemetry)
            .run()
            .unwrap();

        assert_eq!(report.rows, 72);
        assert_eq!(report.predictions.len(), 72);
        assert_eq!(report.evaluation.holdout_rows, 15);
        assert!(report.evaluation.holdout_mae.is_some());
        assert!(report.persisted.is_stored());
        assert!(report.artifact_saved);
        assert_eq!(store.load_batch().unwrap(), report.predictions);
        assert!(report.predictions.iter().all(|p| p.zone == "ZoneA"));

        assert_eq!(report.olap.monthly.len(), 1);
        assert_eq!(report.olap.daily.len(), 3);
        assert_eq!(report.olap.slice.len(), 3);
        assert_eq!(report.olap.dice.len(), 9);

        for event in [EVENT_BATCH_LOADED, EVENT_BATCH_TRAINED, EVENT_BATCH_PERSISTED] {
            assert_eq!(bus.of_type(event).len(), 1, "{event}");
        }
    }

    #[test]
    fn second_run_replaces_previous_predictions() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryPredictionStore::new());
        BatchPipeline::new(small_config(&dir, 30), store.clone())
            .run()
            .unwrap();
        BatchPipeline::new(small_config(&dir, 20), store.clone())
            .run()
            .unwrap();
        assert_eq!(store.load_batch().unwrap().len(), 20);
    }

    #[test]
    fn store_failure_keeps_predictions() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = EnergyTelemetry::builder("energy")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let report = BatchPipeline::new(small_config(&dir, 24), Arc::new(OfflineStore))
            .with_telemetry(telemetry)
            .run()
            .unwrap();
        assert!(matches!(report.persisted, PersistStatus::Failed(_)));
        assert_eq!(report.predictions.len(), 24);
        assert!(!report.olap.is_empty());
        assert_eq!(bus.of_type(EVENT_BATCH_PERSIST_FAILED).len(), 1);
    }

    #[test]
    fn missing_input_aborts_before_store_is_touched() {
        let dir = tempdir().unwrap();
        let mut config = small_config(&dir, 5);
        config.data.csv_path = dir.path().join("missing.csv");
        let store = Arc::new(MemoryPredictionStore::new());
        store
            .replace_batch(&[PredictionRecord::new(
                chrono::NaiveDate::from_ymd_opt(2022, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap(),
                "ZoneA",
                1.0,
            )])
            .unwrap();
        assert!(BatchPipeline::new(config, store.clone()).run().is_err());
        assert_eq!(store.load_batch().unwrap().len(), 1);
    }

    #[test]
    fn olap_report_from_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryPredictionStore::new());
        let report = BatchPipeline::new(small_config(&dir, 48), store.clone())
            .run()
            .unwrap();
        let rebuilt = olap_from_store(store.as_ref(), &OlapParams::default()).unwrap();
        assert_eq!(rebuilt, report.olap);
        assert!(olap_from_store(&OfflineStore, &OlapParams::default()).is_err());
    }
}
