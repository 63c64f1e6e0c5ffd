//! Feature encoding: raw records to a fixed, ordered numeric matrix.
//!
//! Training and inference both go through [`FeatureSchema::encode_row`], so
//! the column layout is decided in exactly one place. The day-of-week policy
//! is part of the schema and travels with every trained model.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Weekday};
use indexmap::IndexMap;
use ndarray::{s, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{weekday_name, Observation, RawRecord, WEEKDAYS};

const NUMERIC_FEATURES: [&str; 11] = [
    "temperature",
    "humidity",
    "square_footage",
    "occupancy",
    "hvac",
    "lighting",
    "renewable_energy",
    "holiday",
    "hour",
    "day",
    "month",
];

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Errors raised while turning raw inputs into features.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodingError {
    /// Timestamp did not match any accepted layout.
    #[error("timestamp {0:?} is not a valid date-time")]
    InvalidTimestamp(String),
    /// Categorical value outside its dictionary.
    #[error("{field} value {value:?} is not one of {allowed}")]
    UnknownCategory {
        /// Column name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted values.
        allowed: &'static str,
    },
    /// Numeric field was NaN or infinite.
    #[error("{field} is not a finite number")]
    InvalidNumber {
        /// Column name.
        field: &'static str,
    },
    /// Value outside its accepted bounds.
    #[error("{field} value {value} outside {min}..={max}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// Historical record without `EnergyConsumption`.
    #[error("record has no EnergyConsumption target")]
    MissingTarget,
    /// Matrix width disagrees with its column names.
    #[error("matrix has {found} columns but the schema names {expected}")]
    WidthMismatch {
        /// Columns named by the schema.
        expected: usize,
        /// Columns present.
        found: usize,
    },
    /// Wraps an error with the zero-based data row it came from.
    #[error("row {row}: {source}")]
    AtRow {
        /// Zero-based data row.
        row: usize,
        /// Underlying failure.
        #[source]
        source: Box<EncodingError>,
    },
}

impl EncodingError {
    fn at_row(self, row: usize) -> Self {
        Self::AtRow {
            row,
            source: Box::new(self),
        }
    }
}

/// Parses the timestamp layouts found in exported building data.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, EncodingError> {
    let raw = raw.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.naive_local());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| EncodingError::InvalidTimestamp(raw.to_string()))
}

/// Ordered feature layout shared by training and inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    drop_first_day: bool,
    names: Vec<String>,
}

impl FeatureSchema {
    /// Builds the layout. With `drop_first_day` the Monday indicator is
    /// omitted and Monday rows encode as all-zero indicators.
    #[must_use]
    pub fn new(drop_first_day: bool) -> Self {
        let skip = usize::from(drop_first_day);
        let names = NUMERIC_FEATURES
            .iter()
            .map(|name| (*name).to_string())
            .chain(WEEKDAYS.iter().skip(skip).map(|day| day_column(*day)))
            .collect();
        Self {
            drop_first_day,
            names,
        }
    }

    /// Whether the first day-of-week category is dropped.
    #[must_use]
    pub const fn drop_first_day(&self) -> bool {
        self.drop_first_day
    }

    /// Column names in order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.names.len()
    }

    /// Encodes one observation into a row of `width()` values.
    #[must_use]
    pub fn encode_row(&self, observation: &Observation) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.width());
        row.extend([
            observation.temperature,
            observation.humidity,
            observation.square_footage,
            observation.occupancy,
            observation.hvac.indicator(),
            observation.lighting.indicator(),
            observation.renewable_energy,
            if observation.holiday { 1.0 } else { 0.0 },
            f64::from(observation.time.hour),
            f64::from(observation.time.day),
            f64::from(observation.time.month),
        ]);
        let skip = usize::from(self.drop_first_day);
        row.extend(WEEKDAYS.iter().skip(skip).map(|day| {
            if *day == observation.day_of_week {
                1.0
            } else {
                0.0
            }
        }));
        row
    }

    /// Named view of one encoded row.
    #[must_use]
    pub fn describe(&self, observation: &Observation) -> IndexMap<String, f64> {
        self.names
            .iter()
            .cloned()
            .zip(self.encode_row(observation))
            .collect()
    }

    /// Encodes observations into a matrix in input order.
    #[must_use]
    pub fn encode(&self, observations: &[Observation]) -> FeatureMatrix {
        let width = self.width();
        let mut values = Array2::<f64>::zeros((observations.len(), width));
        for (mut target, observation) in values.rows_mut().into_iter().zip(observations) {
            for (cell, value) in target.iter_mut().zip(self.encode_row(observation)) {
                *cell = value;
            }
        }
        FeatureMatrix {
            schema: self.clone(),
            values,
        }
    }
}

fn day_column(day: Weekday) -> String {
    format!("day_of_week_{}", weekday_name(day).to_ascii_lowercase())
}

/// Numeric matrix whose columns are described by a [`FeatureSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    schema: FeatureSchema,
    values: Array2<f64>,
}

impl FeatureMatrix {
    /// Wraps pre-computed values, checking the width against the schema.
    pub fn from_values(schema: FeatureSchema, values: Array2<f64>) -> Result<Self, EncodingError> {
        if values.ncols() != schema.width() {
            return Err(EncodingError::WidthMismatch {
                expected: schema.width(),
                found: values.ncols(),
            });
        }
        Ok(Self { schema, values })
    }

    /// Column layout.
    #[must_use]
    pub const fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Column names in order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        self.schema.names()
    }

    /// Row count.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    /// Underlying values.
    #[must_use]
    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// One row.
    #[must_use]
    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    /// Column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.schema
            .names()
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| self.values.column(index))
    }

    /// Copies the rows in `start..end`.
    #[must_use]
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        Self {
            schema: self.schema.clone(),
            values: self.values.slice(s![start..end, ..]).to_owned(),
        }
    }
}

/// Encoded records plus what is needed to turn predictions back into rows.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// Feature matrix, one row per record.
    pub features: FeatureMatrix,
    /// Parsed timestamps, aligned with rows.
    pub timestamps: Vec<NaiveDateTime>,
    /// Typed observations, aligned with rows.
    pub observations: Vec<Observation>,
    /// Targets where the record carried one.
    pub targets: Vec<Option<f64>>,
}

impl EncodedBatch {
    /// Row count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// `true` when no records were encoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Target vector; every record must carry a target.
    pub fn target_vector(&self) -> Result<Vec<f64>, EncodingError> {
        self.targets
            .iter()
            .enumerate()
            .map(|(row, target)| target.ok_or_else(|| EncodingError::MissingTarget.at_row(row)))
            .collect()
    }
}

/// Pure transformation from raw records to an [`EncodedBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureEncoder {
    schema: FeatureSchema,
}

impl FeatureEncoder {
    /// Creates an encoder for the given layout.
    #[must_use]
    pub const fn new(schema: FeatureSchema) -> Self {
        Self { schema }
    }

    /// Layout produced by this encoder.
    #[must_use]
    pub const fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Encodes every record, failing on the first invalid one.
    pub fn encode(&self, records: &[RawRecord]) -> Result<EncodedBatch, EncodingError> {
        let mut timestamps = Vec::with_capacity(records.len());
        let mut observations = Vec::with_capacity(records.len());
        let mut targets = Vec::with_capacity(records.len());
        for (row, raw) in records.iter().enumerate() {
            let (timestamp, observation) =
                Observation::from_raw(raw).map_err(|err| err.at_row(row))?;
            if let Some(target) = raw.energy_consumption {
                if !target.is_finite() {
                    return Err(EncodingError::InvalidNumber {
                        field: "EnergyConsumption",
                    }
                    .at_row(row));
                }
            }
            timestamps.push(timestamp);
            observations.push(observation);
            targets.push(raw.energy_consumption);
        }
        Ok(EncodedBatch {
            features: self.schema.encode(&observations),
            timestamps,
            observations,
            targets,
        })
    }
}
