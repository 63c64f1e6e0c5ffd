#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::cast_precision_loss, clippy::module_name_repetitions)]

//! Building energy prediction: feature encoding, random-forest regression,
//! OLAP-style views and the batch/interactive runtimes around them.

/// Raw and typed records.
#[path = "../record.rs"]
pub mod record;

/// CSV ingestion.
#[path = "../loader.rs"]
pub mod loader;

/// Feature schema and encoder.
#[path = "../encoder.rs"]
pub mod encoder;

/// Regression trees and the forest.
#[path = "../forest.rs"]
pub mod forest;

/// Fit/predict engine with holdout evaluation.
#[path = "../engine.rs"]
pub mod engine;

/// Model artifact lifecycle.
#[path = "../lifecycle.rs"]
pub mod lifecycle;

/// Roll-up, drill-down, slice, dice and pivot views.
#[path = "../aggregation.rs"]
pub mod aggregation;

/// Persistence gateway seam.
#[path = "../store.rs"]
pub mod store;

/// Interactive dashboard session.
#[path = "../session.rs"]
pub mod session;

/// Batch pipeline.
#[path = "../pipeline.rs"]
pub mod pipeline;

/// TOML configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use aggregation::{
    annotate, dice, drill_down, pivot, roll_up, slice, AnnotatedPrediction, DicePredicate,
    GroupedView, OlapParams, OlapReport, PivotTable, SliceView, TimeUnit, ViewStatus,
    NO_DATA_NOTICE,
};
pub use config::EnergyConfig;
pub use encoder::{EncodedBatch, EncodingError, FeatureEncoder, FeatureMatrix, FeatureSchema};
pub use engine::{Evaluation, PredictionEngine, PredictionError, TrainedModel};
pub use forest::{ForestParams, MaxFeatures, RandomForest};
pub use lifecycle::{
    ArtifactExpectation, ModelArtifactError, ModelLifecycle, ModelSource, ServedModel,
    SourceFingerprint,
};
pub use loader::{load_records, LoadError};
pub use pipeline::{olap_from_store, BatchPipeline, BatchReport};
pub use record::{InteractivePrediction, Observation, PredictionRecord, RawRecord, Switch, TimeParts};
pub use session::{FormError, InteractiveSession, PredictionForm, PredictionOutcome, ZoneView};
pub use store::{MemoryPredictionStore, PersistStatus, PredictionStore, StoreError};
pub use telemetry::{EnergyTelemetry, EnergyTelemetryBuilder};
