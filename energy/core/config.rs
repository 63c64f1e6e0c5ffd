//! TOML configuration for batch runs and the interactive surface.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use shared_logging::LogLevel;

use crate::{
    aggregation::OlapParams,
    encoder::FeatureSchema,
    engine::PredictionEngine,
    forest::{ForestParams, MaxFeatures},
};

/// Complete configuration. [`EnergyConfig::default`] is valid on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyConfig {
    /// Input data settings.
    pub data: DataSettings,
    /// Feature layout settings.
    pub encoding: EncodingSettings,
    /// Model settings.
    pub model: ModelSettings,
    /// Persistence endpoints.
    pub store: StoreSettings,
    /// OLAP report filters.
    pub olap: OlapParams,
    /// Logging and event sinks.
    pub telemetry: TelemetrySettings,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        let document = ConfigDocument::default();
        Self::from_document(document, Path::new("."))
    }
}

/// Input data settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// Historical records.
    pub csv_path: PathBuf,
    /// Zone stamped on batch predictions.
    pub zone: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("Energy_consumption.csv"),
            zone: "ZoneA".into(),
        }
    }
}

/// Feature layout settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct EncodingSettings {
    /// Drop the Monday indicator. Applied to training and inference alike.
    pub drop_first_day: bool,
}

/// Model settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Trees in the forest.
    pub n_estimators: usize,
    /// Base random seed.
    pub seed: u64,
    /// Share of trailing rows held out for MAE.
    pub holdout_ratio: f64,
    /// Optional depth limit.
    pub max_depth: Option<usize>,
    /// Minimum rows to split a node.
    pub min_samples_split: usize,
    /// Minimum rows per leaf.
    pub min_samples_leaf: usize,
    /// `"all"`, `"sqrt"`, or a fraction such as `"0.5"`.
    pub max_features: String,
    /// Where the fitted model is cached between runs.
    pub artifact_path: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let params = ForestParams::default();
        Self {
            n_estimators: params.n_estimators,
            seed: params.seed,
            holdout_ratio: 0.2,
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            min_samples_leaf: params.min_samples_leaf,
            max_features: "all".into(),
            artifact_path: PathBuf::from("artifacts/energy_model.json"),
        }
    }
}

/// Persistence endpoints. The batch and dashboard paths may differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Connection URL used by batch runs.
    pub batch_url: String,
    /// Connection URL used by the dashboard.
    pub dashboard_url: String,
}

/// Logging and event sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    /// JSON-lines log file.
    pub log_path: Option<PathBuf>,
    /// JSON-lines event file.
    pub event_log: Option<PathBuf>,
    /// Records below this level are dropped.
    pub min_level: LogLevel,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigDocument {
    data: DataSettings,
    encoding: EncodingSettings,
    model: ModelSettings,
    store: StoreDocument,
    olap: OlapDocument,
    telemetry: TelemetryDocument,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StoreDocument {
    batch_url: Option<String>,
    dashboard_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct OlapDocument {
    drill_month: u32,
    slice_hour: u32,
    dice_month: u32,
    dice_hours: [u32; 2],
}

impl Default for OlapDocument {
    fn default() -> Self {
        let params = OlapParams::default();
        Self {
            drill_month: params.drill_month,
            slice_hour: params.slice_hour,
            dice_month: params.dice_month,
            dice_hours: [params.dice_hours.0, params.dice_hours.1],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TelemetryDocument {
    log_path: Option<PathBuf>,
    event_log: Option<PathBuf>,
    min_level: Option<String>,
}

const DEFAULT_STORE_URL: &str = "sqlite://energy_db.sqlite";

impl EnergyConfig {
    /// Loads, validates and resolves paths relative to the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading energy config {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&raw, &base).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses TOML text; relative paths resolve against `base`.
    pub fn parse(raw: &str, base: &Path) -> Result<Self> {
        let document: ConfigDocument = toml::from_str(raw)?;
        let level = match document.telemetry.min_level.as_deref() {
            Some(level) => level.parse::<LogLevel>()?,
            None => LogLevel::Info,
        };
        let mut config = Self::from_document(document, base);
        config.telemetry.min_level = level;
        config.validate()?;
        Ok(config)
    }

    fn from_document(document: ConfigDocument, base: &Path) -> Self {
        let resolve = |candidate: PathBuf| {
            if candidate.is_absolute() || base == Path::new(".") {
                candidate
            } else {
                base.join(candidate)
            }
        };
        let batch_url = document
            .store
            .batch_url
            .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
        let dashboard_url = document
            .store
            .dashboard_url
            .unwrap_or_else(|| batch_url.clone());
        let mut model = document.model;
        model.artifact_path = resolve(model.artifact_path);
        Self {
            data: DataSettings {
                csv_path: resolve(document.data.csv_path),
                zone: document.data.zone,
            },
            encoding: document.encoding,
            model,
            store: StoreSettings {
                batch_url,
                dashboard_url,
            },
            olap: OlapParams {
                drill_month: document.olap.drill_month,
                slice_hour: document.olap.slice_hour,
                dice_month: document.olap.dice_month,
                dice_hours: (document.olap.dice_hours[0], document.olap.dice_hours[1]),
            },
            telemetry: TelemetrySettings {
                log_path: document.telemetry.log_path.map(&resolve),
                event_log: document.telemetry.event_log.map(&resolve),
                min_level: LogLevel::Info,
            },
        }
    }

    /// Checks ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        ensure!(
            model.holdout_ratio > 0.0 && model.holdout_ratio < 1.0,
            "model.holdout_ratio must be in (0, 1), got {}",
            model.holdout_ratio
        );
        ensure!(model.n_estimators > 0, "model.n_estimators must be positive");
        ensure!(
            model.min_samples_split >= 2,
            "model.min_samples_split must be at least 2"
        );
        ensure!(
            model.min_samples_leaf >= 1,
            "model.min_samples_leaf must be at least 1"
        );
        parse_max_features(&model.max_features)?;
        ensure!(!self.data.zone.trim().is_empty(), "data.zone must not be empty");

        let olap = &self.olap;
        ensure!(
            (1..=12).contains(&olap.drill_month) && (1..=12).contains(&olap.dice_month),
            "olap months must be in 1..=12"
        );
        ensure!(
            olap.slice_hour <= 23 && olap.dice_hours.1 <= 23,
            "olap hours must be in 0..=23"
        );
        ensure!(
            olap.dice_hours.0 <= olap.dice_hours.1,
            "olap.dice_hours must be ordered [low, high]"
        );
        Ok(())
    }

    /// Feature layout for both training and inference.
    #[must_use]
    pub fn schema(&self) -> FeatureSchema {
        FeatureSchema::new(self.encoding.drop_first_day)
    }

    /// Forest hyperparameters.
    pub fn forest_params(&self) -> Result<ForestParams> {
        Ok(ForestParams {
            n_estimators: self.model.n_estimators,
            seed: self.model.seed,
            max_depth: self.model.max_depth,
            min_samples_split: self.model.min_samples_split,
            min_samples_leaf: self.model.min_samples_leaf,
            max_features: parse_max_features(&self.model.max_features)?,
            bootstrap: true,
        })
    }

    /// Engine configured from `[model]`.
    pub fn engine(&self) -> Result<PredictionEngine> {
        Ok(PredictionEngine::new(
            self.forest_params()?,
            self.model.holdout_ratio,
        ))
    }
}

fn parse_max_features(raw: &str) -> Result<MaxFeatures> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "all" => Ok(MaxFeatures::All),
        "sqrt" => Ok(MaxFeatures::Sqrt),
        other => match other.parse::<f64>() {
            Ok(share) if share > 0.0 && share <= 1.0 => Ok(MaxFeatures::Fraction(share)),
            _ => bail!("model.max_features must be \"all\", \"sqrt\" or a fraction in (0, 1], got {raw:?}"),
        },
    }
}
