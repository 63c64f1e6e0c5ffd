//! Prediction engine: fit once on historical features, predict many.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    encoder::{FeatureMatrix, FeatureSchema},
    forest::{ForestParams, RandomForest},
    record::Observation,
};

/// Errors raised by fitting or prediction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictionError {
    /// No rows to fit on.
    #[error("cannot fit on an empty training set")]
    EmptyTrainingSet,
    /// Feature rows and targets disagree.
    #[error("{rows} feature rows but {targets} targets")]
    ShapeMismatch {
        /// Feature rows.
        rows: usize,
        /// Target values.
        targets: usize,
    },
    /// Columns differ from the ones the model was fitted on.
    #[error("feature schema mismatch: model expects {expected:?}, got {found:?}")]
    SchemaMismatch {
        /// Columns seen at fit time.
        expected: Vec<String>,
        /// Columns supplied.
        found: Vec<String>,
    },
}

/// Leading rows train, trailing rows are held out. Order is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldoutSplit {
    /// Training rows `0..train`.
    pub train: usize,
    /// Holdout rows `train..train + holdout`.
    pub holdout: usize,
}

impl HoldoutSplit {
    /// `holdout = ceil(rows * ratio)`, capped so at least one row trains.
    #[must_use]
    pub fn new(rows: usize, ratio: f64) -> Self {
        let wanted = (rows as f64 * ratio.clamp(0.0, 1.0)).ceil() as usize;
        let holdout = wanted.min(rows.saturating_sub(1));
        Self {
            train: rows - holdout,
            holdout,
        }
    }
}

/// Mean absolute error, `None` for empty or misaligned inputs.
#[must_use]
pub fn mean_absolute_error(predictions: &[f64], targets: &[f64]) -> Option<f64> {
    if predictions.is_empty() || predictions.len() != targets.len() {
        return None;
    }
    let total: f64 = predictions
        .iter()
        .zip(targets)
        .map(|(prediction, target)| (prediction - target).abs())
        .sum();
    Some(total / predictions.len() as f64)
}

/// Diagnostics recorded at fit time. Never used to reject a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Rows used for fitting.
    pub training_rows: usize,
    /// Rows held out.
    pub holdout_rows: usize,
    /// MAE over the holdout, absent when nothing was held out.
    pub holdout_mae: Option<f64>,
}

/// Fitted model. Owns no reference to the data it was fitted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    id: Uuid,
    trained_at: DateTime<Utc>,
    schema: FeatureSchema,
    forest: RandomForest,
    evaluation: Evaluation,
}

impl TrainedModel {
    /// Predicts one value per row; the matrix must use the fit-time columns.
    pub fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, PredictionError> {
        if features.names() != self.schema.names() {
            return Err(PredictionError::SchemaMismatch {
                expected: self.schema.names().to_vec(),
                found: features.names().to_vec(),
            });
        }
        Ok(self.forest.predict(features.values()))
    }

    /// Encodes with the model's own schema and predicts.
    #[must_use]
    pub fn predict_observation(&self, observation: &Observation) -> f64 {
        let matrix = self.schema.encode(std::slice::from_ref(observation));
        self.forest.predict_row(matrix.row(0))
    }

    /// Model identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Fit completion time.
    #[must_use]
    pub const fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    /// Column layout.
    #[must_use]
    pub const fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Forest hyperparameters.
    #[must_use]
    pub const fn params(&self) -> &ForestParams {
        self.forest.params()
    }

    /// Fit diagnostics.
    #[must_use]
    pub const fn evaluation(&self) -> &Evaluation {
        &self.evaluation
    }

    /// Verifies the forest can serve rows of this model's schema.
    pub fn check(&self) -> Result<(), String> {
        self.forest.check(self.schema.width())
    }
}

/// Fits forests with fixed hyperparameters and a fixed holdout policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionEngine {
    params: ForestParams,
    holdout_ratio: f64,
}

impl Default for PredictionEngine {
    fn default() -> Self {
        Self::new(ForestParams::default(), 0.2)
    }
}

impl PredictionEngine {
    /// Creates an engine.
    #[must_use]
    pub const fn new(params: ForestParams, holdout_ratio: f64) -> Self {
        Self {
            params,
            holdout_ratio,
        }
    }

    /// Forest hyperparameters.
    #[must_use]
    pub const fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Fits on the leading rows and measures MAE on the trailing holdout.
    /// Degenerate input (one row, constant targets) yields a constant model.
    pub fn fit(
        &self,
        features: &FeatureMatrix,
        targets: &[f64],
    ) -> Result<TrainedModel, PredictionError> {
        if features.rows() != targets.len() {
            return Err(PredictionError::ShapeMismatch {
                rows: features.rows(),
                targets: targets.len(),
            });
        }
        if targets.is_empty() {
            return Err(PredictionError::EmptyTrainingSet);
        }
        let split = HoldoutSplit::new(targets.len(), self.holdout_ratio);
        let training = features.slice_rows(0, split.train);
        let forest = RandomForest::fit(training.values(), &targets[..split.train], &self.params);

        let holdout = features.slice_rows(split.train, targets.len());
        let holdout_predictions = forest.predict(holdout.values());
        let evaluation = Evaluation {
            training_rows: split.train,
            holdout_rows: split.holdout,
            holdout_mae: mean_absolute_error(&holdout_predictions, &targets[split.train..]),
        };

        Ok(TrainedModel {
            id: Uuid::new_v4(),
            trained_at: Utc::now(),
            schema: features.schema().clone(),
            forest,
            evaluation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Switch, TimeParts};
    use chrono::Weekday;

    fn observation(hour: u32, hvac: Switch) -> Observation {
        Observation {
            temperature: 20.0 + f64::from(hour),
            humidity: 45.0,
            square_footage: 1000.0,
            occupancy: 3.0,
            hvac,
            lighting: Switch::On,
            renewable_energy: 1.0,
            holiday: false,
            time: TimeParts::new(hour, 10, 2).unwrap(),
            day_of_week: Weekday::Thu,
        }
    }

    fn training_set(schema: &FeatureSchema) -> (FeatureMatrix, Vec<f64>) {
        let observations: Vec<Observation> = (0..24)
            .map(|hour| observation(hour, if hour % 2 == 0 { Switch::On } else { Switch::Off }))
            .collect();
        let targets = observations
            .iter()
            .map(|o| if o.hvac == Switch::On { 90.0 } else { 60.0 })
            .collect();
        (schema.encode(&observations), targets)
    }

    fn small_engine() -> PredictionEngine {
        PredictionEngine::new(
            ForestParams {
                n_estimators: 10,
                ..ForestParams::default()
            },
            0.2,
        )
    }

    #[test]
    fn holdout_split_preserves_order_and_keeps_a_training_row() {
        assert_eq!(HoldoutSplit::new(10, 0.2), HoldoutSplit { train: 8, holdout: 2 });
        assert_eq!(HoldoutSplit::new(5, 0.2), HoldoutSplit { train: 4, holdout: 1 });
        assert_eq!(HoldoutSplit::new(1, 0.2), HoldoutSplit { train: 1, holdout: 0 });
        assert_eq!(HoldoutSplit::new(0, 0.2), HoldoutSplit { train: 0, holdout: 0 });
    }

    #[test]
    fn mae_matches_manual_computation() {
        assert_eq!(mean_absolute_error(&[1.0, 4.0], &[2.0, 2.0]), Some(1.5));
        assert_eq!(mean_absolute_error(&[], &[]), None);
        assert_eq!(mean_absolute_error(&[1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn fit_reports_holdout_mae() {
        let schema = FeatureSchema::new(false);
        let (features, targets) = training_set(&schema);
        let model = small_engine().fit(&features, &targets).unwrap();
        let evaluation = model.evaluation();
        assert_eq!(evaluation.training_rows, 19);
        assert_eq!(evaluation.holdout_rows, 5);
        assert!(evaluation.holdout_mae.unwrap() >= 0.0);
        assert_eq!(model.predict(&features).unwrap().len(), 24);
    }

    #[test]
    fn rejects_mismatched_schema() {
        let (features, targets) = training_set(&FeatureSchema::new(false));
        let model = small_engine().fit(&features, &targets).unwrap();
        let (other, _) = training_set(&FeatureSchema::new(true));
        let err = model.predict(&other).unwrap_err();
        assert!(matches!(err, PredictionError::SchemaMismatch { .. }));
    }

    #[test]
    fn rejects_reordered_columns() {
        let (features, targets) = training_set(&FeatureSchema::new(false));
        let model = small_engine().fit(&features, &targets).unwrap();
        let mut names = FeatureSchema::new(false).names().to_vec();
        names.swap(0, 1);
        let reordered: FeatureSchema = serde_json::from_value(serde_json::json!({
            "drop_first_day": false,
            "names": names,
        }))
        .unwrap();
        let matrix =
            FeatureMatrix::from_values(reordered, features.values().to_owned()).unwrap();
        assert!(matches!(
            model.predict(&matrix),
            Err(PredictionError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn rejects_empty_and_misaligned_inputs() {
        let schema = FeatureSchema::new(false);
        let empty = schema.encode(&[]);
        assert_eq!(
            small_engine().fit(&empty, &[]),
            Err(PredictionError::EmptyTrainingSet)
        );
        let (features, _) = training_set(&schema);
        assert_eq!(
            small_engine().fit(&features, &[1.0]),
            Err(PredictionError::ShapeMismatch { rows: 24, targets: 1 })
        );
    }

    #[test]
    fn single_row_fit_is_degenerate_but_valid() {
        let schema = FeatureSchema::new(false);
        let features = schema.encode(&[observation(3, Switch::On)]);
        let model = small_engine().fit(&features, &[42.0]).unwrap();
        assert_eq!(model.evaluation().holdout_mae, None);
        assert_eq!(model.predict_observation(&observation(20, Switch::Off)), 42.0);
    }

    #[test]
    fn observation_prediction_matches_matrix_prediction() {
        let schema = FeatureSchema::new(false);
        let (features, targets) = training_set(&schema);
        let model = small_engine().fit(&features, &targets).unwrap();
        let sample = observation(7, Switch::Off);
        let via_matrix = model.predict(&schema.encode(&[sample.clone()])).unwrap()[0];
        assert_eq!(model.predict_observation(&sample), via_matrix);
    }
}
