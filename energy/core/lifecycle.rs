//! Train once, reuse many times: the fitted model is cached as a JSON
//! artifact and reloaded while it still matches the configured feature
//! layout, forest hyperparameters and historical file.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    config::EnergyConfig,
    encoder::{EncodedBatch, FeatureEncoder, FeatureSchema},
    engine::{PredictionEngine, TrainedModel},
    forest::ForestParams,
    loader::load_records,
    telemetry::{EnergyTelemetry, EVENT_BATCH_LOADED, EVENT_BATCH_TRAINED},
};

/// Errors raised while reading or writing a model artifact.
#[derive(Debug, Error)]
pub enum ModelArtifactError {
    /// Artifact could not be read or written.
    #[error("model artifact io error: {0}")]
    Io(#[from] std::io::Error),
    /// Artifact is not a serialized model.
    #[error("model artifact is malformed: {0}")]
    Json(#[from] serde_json::Error),
    /// Artifact was fitted with a different feature layout.
    #[error("model artifact expects columns {found:?}, configuration yields {expected:?}")]
    SchemaDrift {
        /// Columns of the configured schema.
        expected: Vec<String>,
        /// Columns stored in the artifact.
        found: Vec<String>,
    },
    /// Artifact was fitted with different forest hyperparameters.
    #[error("model artifact was fitted with {found:?}, configuration asks for {expected:?}")]
    ParamsDrift {
        /// Configured hyperparameters.
        expected: Box<ForestParams>,
        /// Hyperparameters stored in the artifact.
        found: Box<ForestParams>,
    },
    /// Historical file changed since the artifact was fitted.
    #[error("historical file changed since the model artifact was fitted")]
    SourceChanged,
    /// Trees reference columns or nodes that do not exist.
    #[error("model artifact is inconsistent: {0}")]
    Corrupt(String),
}

/// Size and modification time of the historical file a model was fitted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    /// File length in bytes.
    pub bytes: u64,
    /// Last modification, when the platform reports it.
    pub modified: Option<DateTime<Utc>>,
}

impl SourceFingerprint {
    /// Reads the fingerprint of `path`.
    pub fn of(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            bytes: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

/// What an artifact must match to be reused.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactExpectation<'a> {
    /// Configured feature layout.
    pub schema: &'a FeatureSchema,
    /// Configured forest hyperparameters.
    pub params: &'a ForestParams,
    /// Fingerprint of the current historical file.
    pub source: Option<&'a SourceFingerprint>,
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    source: Option<&'a SourceFingerprint>,
    model: &'a TrainedModel,
}

#[derive(Deserialize)]
struct ArtifactDocument {
    source: Option<SourceFingerprint>,
    model: TrainedModel,
}

/// Reads an artifact and checks it against the expected layout,
/// hyperparameters and historical file.
pub fn load_artifact(
    path: impl AsRef<Path>,
    expected: &ArtifactExpectation<'_>,
) -> Result<TrainedModel, ModelArtifactError> {
    let file = File::open(path)?;
    let document: ArtifactDocument = serde_json::from_reader(BufReader::new(file))?;
    let model = document.model;
    if model.schema() != expected.schema {
        return Err(ModelArtifactError::SchemaDrift {
            expected: expected.schema.names().to_vec(),
            found: model.schema().names().to_vec(),
        });
    }
    if model.params() != expected.params {
        return Err(ModelArtifactError::ParamsDrift {
            expected: Box::new(expected.params.clone()),
            found: Box::new(model.params().clone()),
        });
    }
    match (document.source.as_ref(), expected.source) {
        (Some(stored), Some(current)) if stored == current => {}
        _ => return Err(ModelArtifactError::SourceChanged),
    }
    model.check().map_err(ModelArtifactError::Corrupt)?;
    Ok(model)
}

/// Writes an artifact, creating parent directories.
pub fn save_artifact(
    model: &TrainedModel,
    source: Option<&SourceFingerprint>,
    path: impl AsRef<Path>,
) -> Result<(), ModelArtifactError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let document = ArtifactRef { source, model };
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &document)?;
    writer.flush()?;
    Ok(())
}

/// Where a served model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    /// Reused from the artifact.
    Artifact,
    /// Fitted during this call.
    Trained,
}

/// Model ready to serve.
#[derive(Debug, Clone)]
pub struct ServedModel {
    /// The model.
    pub model: TrainedModel,
    /// Origin of the model.
    pub source: ModelSource,
}

/// Fresh fit plus the batch it was fitted on.
#[derive(Debug, Clone)]
pub struct TrainingRun {
    /// Encoded historical records.
    pub batch: EncodedBatch,
    /// Fitted model.
    pub model: TrainedModel,
    /// `true` when the artifact was refreshed.
    pub artifact_saved: bool,
}

/// Owns the model artifact for one configuration.
#[derive(Debug, Clone)]
pub struct ModelLifecycle {
    csv_path: PathBuf,
    artifact_path: PathBuf,
    schema: FeatureSchema,
    engine: PredictionEngine,
    telemetry: Option<EnergyTelemetry>,
}

impl ModelLifecycle {
    /// Builds a lifecycle from configuration.
    pub fn new(config: &EnergyConfig) -> Result<Self> {
        Ok(Self {
            csv_path: config.data.csv_path.clone(),
            artifact_path: config.model.artifact_path.clone(),
            schema: config.schema(),
            engine: config.engine()?,
            telemetry: None,
        })
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EnergyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Artifact location.
    #[must_use]
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Feature layout every served model uses.
    #[must_use]
    pub const fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Reuses the artifact when it matches the configured layout,
    /// hyperparameters and historical file, otherwise fits from the
    /// historical file and refreshes the artifact.
    pub fn load_or_train(&self) -> Result<ServedModel> {
        if self.artifact_path.exists() {
            let source = SourceFingerprint::of(&self.csv_path).ok();
            let expected = ArtifactExpectation {
                schema: &self.schema,
                params: self.engine.params(),
                source: source.as_ref(),
            };
            match load_artifact(&self.artifact_path, &expected) {
                Ok(model) => {
                    self.log(
                        LogLevel::Info,
                        "energy.model.loaded",
                        json!({
                            "artifact": self.artifact_path,
                            "model_id": model.id(),
                            "trained_at": model.trained_at(),
                        }),
                    );
                    return Ok(ServedModel {
                        model,
                        source: ModelSource::Artifact,
                    });
                }
                Err(err) => self.log(
                    LogLevel::Warn,
                    "energy.model.stale",
                    json!({ "artifact": self.artifact_path, "error": err.to_string() }),
                ),
            }
        }
        let run = self.train_and_store()?;
        Ok(ServedModel {
            model: run.model,
            source: ModelSource::Trained,
        })
    }

    /// Loads and encodes the historical file, fits, and refreshes the
    /// artifact. A failed artifact write is logged, not returned.
    pub fn train_and_store(&self) -> Result<TrainingRun> {
        let source = SourceFingerprint::of(&self.csv_path).ok();
        let records = load_records(&self.csv_path)
            .with_context(|| format!("loading {}", self.csv_path.display()))?;
        let batch = FeatureEncoder::new(self.schema.clone())
            .encode(&records)
            .with_context(|| format!("encoding {}", self.csv_path.display()))?;
        let targets = batch.target_vector().context("reading training targets")?;
        self.log(
            LogLevel::Info,
            EVENT_BATCH_LOADED,
            json!({ "path": self.csv_path, "rows": batch.len() }),
        );
        self.event(
            EVENT_BATCH_LOADED,
            json!({ "rows": batch.len(), "columns": self.schema.width() }),
        );

        let model = self
            .engine
            .fit(&batch.features, &targets)
            .context("fitting energy model")?;
        let evaluation = model.evaluation();
        self.log(
            LogLevel::Info,
            EVENT_BATCH_TRAINED,
            json!({
                "model_id": model.id(),
                "training_rows": evaluation.training_rows,
                "holdout_rows": evaluation.holdout_rows,
                "holdout_mae": evaluation.holdout_mae,
            }),
        );
        self.event(
            EVENT_BATCH_TRAINED,
            json!({ "model_id": model.id(), "holdout_mae": evaluation.holdout_mae }),
        );

        let artifact_saved = match save_artifact(&model, source.as_ref(), &self.artifact_path) {
            Ok(()) => true,
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "energy.model.save_failed",
                    json!({ "artifact": self.artifact_path, "error": err.to_string() }),
                );
                false
            }
        };
        Ok(TrainingRun {
            batch,
            model,
            artifact_saved,
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::loader::LoadError;
    use shared_logging::MemoryLogger;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const HEADER: &str = "Timestamp,Temperature,Humidity,SquareFootage,Occupancy,HVACUsage,LightingUsage,RenewableEnergy,DayOfWeek,Holiday,EnergyConsumption\n";
    const DAYS: [&str; 7] = [
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
        "Sunday",
    ];

    /// Writes `rows` hourly records starting 2022-01-01 00:00 whose target
    /// depends on HVAC state and temperature.
    pub(crate) fn write_history(dir: &Path, rows: usize) -> PathBuf {
        let mut csv = String::from(HEADER);
        for row in 0..rows {
            let day = row / 24 + 1;
            let hour = row % 24;
            let hvac = if row % 3 == 0 { "Off" } else { "On" };
            let temperature = 20.0 + (row % 10) as f64;
            let target = (if hvac == "On" { 70.0 } else { 50.0 }) + temperature / 2.0;
            csv.push_str(&format!(
                "2022-01-{day:02} {hour:02}:00:00,{temperature},45.0,1500.0,{occ},{hvac},On,3.5,{dow},No,{target}\n",
                occ = row % 7,
                dow = DAYS[(day + 4) % 7],
            ));
        }
        let path = dir.join("Energy_consumption.csv");
        fs::write(&path, csv).unwrap();
        path
    }

    pub(crate) fn small_config(dir: &TempDir, rows: usize) -> EnergyConfig {
        let mut config = EnergyConfig::default();
        config.data.csv_path = write_history(dir.path(), rows);
        config.model.n_estimators = 8;
        config.model.artifact_path = dir.path().join("artifacts/model.json");
        config
    }

    #[test]
    fn trains_then_reuses_artifact() {
        let dir = tempdir().unwrap();
        let config = small_config(&dir, 48);
        let lifecycle = ModelLifecycle::new(&config).unwrap();

        let first = lifecycle.load_or_train().unwrap();
        assert_eq!(first.source, ModelSource::Trained);
        assert!(lifecycle.artifact_path().exists());

        let second = lifecycle.load_or_train().unwrap();
        assert_eq!(second.source, ModelSource::Artifact);
        assert_eq!(second.model.id(), first.model.id());
        assert_eq!(second.model.schema(), first.model.schema());
    }

    #[test]
    fn retrains_when_schema_drifts() {
        let dir = tempdir().unwrap();
        let mut config = small_config(&dir, 30);
        ModelLifecycle::new(&config)
            .unwrap()
            .load_or_train()
            .unwrap();

        config.encoding.drop_first_day = true;
        let sink = Arc::new(MemoryLogger::default());
        let telemetry = EnergyTelemetry::builder("energy")
            .log_sink(sink.clone())
            .build()
            .unwrap();
        let lifecycle = ModelLifecycle::new(&config)
            .unwrap()
            .with_telemetry(telemetry);
        let served = lifecycle.load_or_train().unwrap();
        assert_eq!(served.source, ModelSource::Trained);
        assert_eq!(served.model.schema().width(), 17);
        assert!(sink.contains("energy.model.stale"));
    }

    #[test]
    fn schema_drift_is_a_distinct_error() {
        let dir = tempdir().unwrap();
        let config = small_config(&dir, 20);
        let run = ModelLifecycle::new(&config)
            .unwrap()
            .train_and_store()
            .unwrap();
        let source = SourceFingerprint::of(&config.data.csv_path).unwrap();
        let params = config.forest_params().unwrap();
        let dropped = FeatureSchema::new(true);
        let expected = ArtifactExpectation {
            schema: &dropped,
            params: &params,
            source: Some(&source),
        };
        let err = load_artifact(&config.model.artifact_path, &expected).unwrap_err();
        assert!(matches!(err, ModelArtifactError::SchemaDrift { .. }));
        assert_eq!(run.batch.len(), 20);
        assert!(run.artifact_saved);
    }

    fn logged_lifecycle(config: &EnergyConfig) -> (ModelLifecycle, Arc<MemoryLogger>) {
        let sink = Arc::new(MemoryLogger::default());
        let telemetry = EnergyTelemetry::builder("energy")
            .log_sink(sink.clone())
            .build()
            .unwrap();
        let lifecycle = ModelLifecycle::new(config)
            .unwrap()
            .with_telemetry(telemetry);
        (lifecycle, sink)
    }

    #[test]
    fn retrains_when_hyperparameters_change() {
        let dir = tempdir().unwrap();
        let mut config = small_config(&dir, 30);
        let first = ModelLifecycle::new(&config)
            .unwrap()
            .load_or_train()
            .unwrap();
        assert_eq!(first.model.params().n_estimators, 8);

        config.model.n_estimators = 3;
        config.model.seed = 7;
        let (lifecycle, sink) = logged_lifecycle(&config);
        let served = lifecycle.load_or_train().unwrap();
        assert_eq!(served.source, ModelSource::Trained);
        assert_eq!(served.model.params().n_estimators, 3);
        assert_eq!(served.model.params().seed, 7);
        assert!(sink.contains("energy.model.stale"));

        let again = lifecycle.load_or_train().unwrap();
        assert_eq!(again.source, ModelSource::Artifact);
    }

    #[test]
    fn params_drift_is_reported() {
        let dir = tempdir().unwrap();
        let config = small_config(&dir, 20);
        ModelLifecycle::new(&config)
            .unwrap()
            .train_and_store()
            .unwrap();
        let source = SourceFingerprint::of(&config.data.csv_path).unwrap();
        let schema = config.schema();
        let params = ForestParams {
            n_estimators: 3,
            ..config.forest_params().unwrap()
        };
        let expected = ArtifactExpectation {
            schema: &schema,
            params: &params,
            source: Some(&source),
        };
        let err = load_artifact(&config.model.artifact_path, &expected).unwrap_err();
        assert!(matches!(err, ModelArtifactError::ParamsDrift { .. }));
    }

    #[test]
    fn retrains_when_history_changes() {
        let dir = tempdir().unwrap();
        let config = small_config(&dir, 30);
        let first = ModelLifecycle::new(&config)
            .unwrap()
            .load_or_train()
            .unwrap();

        write_history(dir.path(), 40);
        let (lifecycle, sink) = logged_lifecycle(&config);
        let served = lifecycle.load_or_train().unwrap();
        assert_eq!(served.source, ModelSource::Trained);
        assert_ne!(served.model.id(), first.model.id());
        assert_eq!(served.model.evaluation().training_rows, 32);
        assert!(sink.contains("energy.model.stale"));
    }

    #[test]
    fn inconsistent_artifact_is_retrained() {
        let dir = tempdir().unwrap();
        let config = small_config(&dir, 24);
        let lifecycle = ModelLifecycle::new(&config).unwrap();
        lifecycle.train_and_store().unwrap();

        let path = lifecycle.artifact_path();
        let mut document: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        document["model"]["forest"]["trees"][0]["nodes"] = json!([
            { "Split": { "feature": 0, "threshold": 1.0, "left": 1, "right": 40 } },
            { "Leaf": { "value": 1.0 } }
        ]);
        fs::write(path, document.to_string()).unwrap();

        let source = SourceFingerprint::of(&config.data.csv_path).unwrap();
        let schema = config.schema();
        let params = config.forest_params().unwrap();
        let expected = ArtifactExpectation {
            schema: &schema,
            params: &params,
            source: Some(&source),
        };
        let err = load_artifact(path, &expected);
        assert!(matches!(err, Err(ModelArtifactError::Corrupt(_))));

        let served = lifecycle.load_or_train().unwrap();
        assert_eq!(served.source, ModelSource::Trained);
        assert!(served.model.check().is_ok());
    }

    #[test]
    fn unwritable_artifact_does_not_fail_training() {
        let dir = tempdir().unwrap();
        let mut config = small_config(&dir, 20);
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        config.model.artifact_path = blocker.join("model.json");
        let run = ModelLifecycle::new(&config)
            .unwrap()
            .train_and_store()
            .unwrap();
        assert!(!run.artifact_saved);
    }

    #[test]
    fn missing_history_fails_fast() {
        let dir = tempdir().unwrap();
        let mut config = small_config(&dir, 5);
        config.data.csv_path = dir.path().join("absent.csv");
        let err = ModelLifecycle::new(&config)
            .unwrap()
            .load_or_train()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoadError>(),
            Some(LoadError::FileNotFound(_))
        ));
    }
}
