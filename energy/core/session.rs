//! Interactive surface: zone browsing plus single-record prediction against
//! a model that is loaded once per session.

use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, Weekday};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    engine::TrainedModel,
    record::{weekday_name, InteractivePrediction, Observation, PredictionRecord, Switch, TimeParts},
    store::{PersistStatus, PredictionStore},
    telemetry::{EnergyTelemetry, EVENT_INTERACTIVE_PREDICTED},
};

/// Shown when a zone has no stored predictions.
pub const EMPTY_ZONE_NOTICE: &str = "No data available for the selected zone.";

/// Rejected form input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormError {
    /// Value outside a closed range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Form field.
        field: &'static str,
        /// Submitted value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// Value below a lower bound.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Form field.
        field: &'static str,
        /// Submitted value.
        value: f64,
        /// Lower bound.
        min: f64,
    },
    /// NaN or infinite input.
    #[error("{field} is not a finite number")]
    NotFinite {
        /// Form field.
        field: &'static str,
    },
}

/// Inputs of one interactive prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionForm {
    /// Temperature (°C), 0 to 50.
    pub temperature: f64,
    /// Humidity (%), 0 to 100.
    pub humidity: f64,
    /// Square footage, 100 to 10000.
    pub square_footage: f64,
    /// Occupancy, 0 to 1000.
    pub occupancy: u32,
    /// HVAC state.
    pub hvac: Switch,
    /// Lighting state.
    pub lighting: Switch,
    /// Renewable energy generated (kWh), at least 0.
    pub renewable_energy: f64,
    /// Holiday flag.
    pub holiday: bool,
    /// Hour of day, 0 to 23.
    pub hour: u32,
    /// Day of month, 1 to 31.
    pub day: u32,
    /// Month, 1 to 12.
    pub month: u32,
    /// Day of week.
    pub day_of_week: Weekday,
}

impl Default for PredictionForm {
    fn default() -> Self {
        Self {
            temperature: 25.0,
            humidity: 50.0,
            square_footage: 1000.0,
            occupancy: 10,
            hvac: Switch::On,
            lighting: Switch::On,
            renewable_energy: 5.0,
            holiday: false,
            hour: 12,
            day: 15,
            month: 6,
            day_of_week: Weekday::Mon,
        }
    }
}

fn within(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, FormError> {
    if !value.is_finite() {
        return Err(FormError::NotFinite { field });
    }
    if value < min || value > max {
        return Err(FormError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

impl PredictionForm {
    /// Checks the bounds and converts into an observation.
    pub fn validate(&self) -> Result<Observation, FormError> {
        let temperature = within("temperature", self.temperature, 0.0, 50.0)?;
        let humidity = within("humidity", self.humidity, 0.0, 100.0)?;
        let square_footage = within("square_footage", self.square_footage, 100.0, 10_000.0)?;
        let occupancy = within("occupancy", f64::from(self.occupancy), 0.0, 1000.0)?;
        if !self.renewable_energy.is_finite() {
            return Err(FormError::NotFinite {
                field: "renewable_energy",
            });
        }
        if self.renewable_energy < 0.0 {
            return Err(FormError::BelowMinimum {
                field: "renewable_energy",
                value: self.renewable_energy,
                min: 0.0,
            });
        }
        within("hour", f64::from(self.hour), 0.0, 23.0)?;
        within("day", f64::from(self.day), 1.0, 31.0)?;
        within("month", f64::from(self.month), 1.0, 12.0)?;
        let time = TimeParts::new(self.hour, self.day, self.month).map_err(|_| {
            FormError::OutOfRange {
                field: "day",
                value: f64::from(self.day),
                min: 1.0,
                max: 31.0,
            }
        })?;
        Ok(Observation {
            temperature,
            humidity,
            square_footage,
            occupancy,
            hvac: self.hvac,
            lighting: self.lighting,
            renewable_energy: self.renewable_energy,
            holiday: self.holiday,
            time,
            day_of_week: self.day_of_week,
        })
    }
}

/// One point of a zone chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    /// X axis.
    pub timestamp: NaiveDateTime,
    /// Y axis.
    pub predicted_energy: f64,
}

/// Stored predictions of one zone, ready to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneView {
    /// Selected zone.
    pub zone: String,
    /// Oldest first.
    pub chart: Vec<ChartPoint>,
    /// Newest first.
    pub preview: Vec<PredictionRecord>,
    /// Set when the zone has no data.
    pub notice: Option<&'static str>,
}

impl ZoneView {
    fn from_records(zone: &str, mut records: Vec<PredictionRecord>) -> Self {
        records.sort_by_key(|record| record.timestamp);
        let chart = records
            .iter()
            .map(|record| ChartPoint {
                timestamp: record.timestamp,
                predicted_energy: record.predicted_energy,
            })
            .collect();
        let notice = records.is_empty().then_some(EMPTY_ZONE_NOTICE);
        records.reverse();
        Self {
            zone: zone.to_string(),
            chart,
            preview: records,
            notice,
        }
    }

    /// `true` when the zone has no stored predictions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chart.is_empty()
    }
}

/// Result of one form submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutcome {
    /// Model output (kWh).
    pub predicted_energy: f64,
    /// Encoded inputs by feature name.
    pub features: IndexMap<String, f64>,
    /// Zone chart with the new point appended.
    pub chart: Vec<ChartPoint>,
    /// Set when the zone history could not be read; the chart then holds
    /// only the new point.
    pub history_error: Option<String>,
    /// Store result.
    pub persisted: PersistStatus,
}

/// Single-user interactive session.
pub struct InteractiveSession {
    store: Arc<dyn PredictionStore>,
    model: TrainedModel,
    telemetry: Option<EnergyTelemetry>,
}

impl fmt::Debug for InteractiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveSession")
            .field("model_id", &self.model.id())
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl InteractiveSession {
    /// Creates a session serving `model`.
    #[must_use]
    pub fn new(store: Arc<dyn PredictionStore>, model: TrainedModel) -> Self {
        Self {
            store,
            model,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EnergyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Model served by this session.
    #[must_use]
    pub const fn model(&self) -> &TrainedModel {
        &self.model
    }

    /// Zones with stored batch predictions.
    pub fn zones(&self) -> Result<Vec<String>> {
        self.store.zones().context("listing zones")
    }

    /// Chart and preview for one zone. An unknown zone yields an empty view
    /// with a notice.
    pub fn zone_view(&self, zone: &str) -> Result<ZoneView> {
        let records = self
            .store
            .load_zone(zone)
            .with_context(|| format!("loading predictions for {zone}"))?;
        Ok(ZoneView::from_records(zone, records))
    }

    /// Predicts for the form, timestamping the chart point with local time.
    pub fn submit(&self, zone: &str, form: &PredictionForm) -> Result<PredictionOutcome> {
        self.submit_at(zone, form, Local::now().naive_local())
    }

    /// Predicts for the form; `now` positions the new chart point.
    /// Invalid input is an error. Failed store reads and writes are reported
    /// in the outcome.
    pub fn submit_at(
        &self,
        zone: &str,
        form: &PredictionForm,
        now: NaiveDateTime,
    ) -> Result<PredictionOutcome> {
        let observation = form.validate()?;
        let predicted_energy = self.model.predict_observation(&observation);
        let features = self.model.schema().describe(&observation);

        let (mut chart, history_error) = match self.zone_view(zone) {
            Ok(view) => (view.chart, None),
            Err(err) => {
                let reason = format!("{err:#}");
                self.log(
                    LogLevel::Error,
                    "energy.interactive.load_failed",
                    json!({ "zone": zone, "error": reason }),
                );
                (Vec::new(), Some(reason))
            }
        };
        chart.push(ChartPoint {
            timestamp: now,
            predicted_energy,
        });

        let prediction = InteractivePrediction {
            zone: zone.to_string(),
            observation,
            predicted_energy,
        };
        let persisted = match self.store.append_interactive(&prediction) {
            Ok(()) => PersistStatus::Stored,
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "energy.interactive.persist_failed",
                    json!({ "zone": zone, "error": err.to_string() }),
                );
                PersistStatus::Failed(err.to_string())
            }
        };

        self.log(
            LogLevel::Info,
            EVENT_INTERACTIVE_PREDICTED,
            json!({
                "zone": zone,
                "predicted_energy": predicted_energy,
                "day_of_week": weekday_name(form.day_of_week),
                "stored": persisted.is_stored(),
            }),
        );
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(
                EVENT_INTERACTIVE_PREDICTED,
                json!({ "zone": zone, "predicted_energy": predicted_energy }),
            );
        }

        Ok(PredictionOutcome {
            predicted_energy,
            features,
            chart,
            history_error,
            persisted,
        })
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encoder::FeatureSchema,
        engine::PredictionEngine,
        forest::ForestParams,
        store::{MemoryPredictionStore, StoreError},
    };
    use chrono::NaiveDate;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::MemoryLogger;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn model() -> TrainedModel {
        let schema = FeatureSchema::new(false);
        let observations: Vec<Observation> = (0..12_u32)
            .map(|i| Observation {
                hvac: if i % 2 == 0 { Switch::On } else { Switch::Off },
                time: TimeParts::new(i, 1 + i, 1).unwrap(),
                ..PredictionForm::default().validate().unwrap()
            })
            .collect();
        let targets: Vec<f64> = observations
            .iter()
            .map(|o| if o.hvac == Switch::On { 80.0 } else { 40.0 })
            .collect();
        let engine = PredictionEngine::new(
            ForestParams {
                n_estimators: 5,
                ..ForestParams::default()
            },
            0.2,
        );
        engine.fit(&schema.encode(&observations), &targets).unwrap()
    }

    fn seeded_store() -> Arc<MemoryPredictionStore> {
        let store = Arc::new(MemoryPredictionStore::new());
        store
            .replace_batch(&[
                PredictionRecord::new(ts(2, 0), "ZoneA", 70.0),
                PredictionRecord::new(ts(1, 0), "ZoneA", 60.0),
                PredictionRecord::new(ts(1, 5), "ZoneB", 10.0),
            ])
            .unwrap();
        store
    }

    struct ReadOnlyStore(MemoryPredictionStore);

    impl PredictionStore for ReadOnlyStore {
        fn replace_batch(&self, records: &[PredictionRecord]) -> Result<usize, StoreError> {
            self.0.replace_batch(records)
        }

        fn load_batch(&self) -> Result<Vec<PredictionRecord>, StoreError> {
            self.0.load_batch()
        }

        fn append_interactive(&self, _: &InteractivePrediction) -> Result<(), StoreError> {
            Err(StoreError::Query("attempt to write a readonly database".into()))
        }

        fn load_interactive(&self) -> Result<Vec<InteractivePrediction>, StoreError> {
            self.0.load_interactive()
        }
    }

    #[test]
    fn form_defaults_are_valid_and_bounds_enforced() {
        let observation = PredictionForm::default().validate().unwrap();
        assert_eq!(observation.time, TimeParts::new(12, 15, 6).unwrap());
        assert_eq!(observation.occupancy, 10.0);

        let hot = PredictionForm {
            temperature: 51.0,
            ..PredictionForm::default()
        };
        assert!(matches!(
            hot.validate(),
            Err(FormError::OutOfRange { field: "temperature", .. })
        ));
        let late = PredictionForm {
            hour: 24,
            ..PredictionForm::default()
        };
        assert!(late.validate().is_err());
        let negative = PredictionForm {
            renewable_energy: -1.0,
            ..PredictionForm::default()
        };
        assert!(matches!(
            negative.validate(),
            Err(FormError::BelowMinimum { .. })
        ));
        let nan = PredictionForm {
            humidity: f64::NAN,
            ..PredictionForm::default()
        };
        assert_eq!(
            nan.validate(),
            Err(FormError::NotFinite { field: "humidity" })
        );
    }

    #[test]
    fn zone_view_orders_chart_and_preview() {
        let session = InteractiveSession::new(seeded_store(), model());
        assert_eq!(session.zones().unwrap(), vec!["ZoneA", "ZoneB"]);
        let view = session.zone_view("ZoneA").unwrap();
        assert_eq!(view.chart[0].timestamp, ts(1, 0));
        assert_eq!(view.chart[1].timestamp, ts(2, 0));
        assert_eq!(view.preview[0].timestamp, ts(2, 0));
        assert!(view.notice.is_none());
    }

    #[test]
    fn unknown_zone_is_empty_with_notice() {
        let session = InteractiveSession::new(seeded_store(), model());
        let view = session.zone_view("ZoneZ").unwrap();
        assert!(view.is_empty());
        assert_eq!(view.notice, Some(EMPTY_ZONE_NOTICE));
    }

    #[test]
    fn submit_predicts_appends_and_stores() {
        let store = seeded_store();
        let bus = Arc::new(MemoryEventBus::new(4));
        let telemetry = EnergyTelemetry::builder("energy")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let session = InteractiveSession::new(store.clone(), model()).with_telemetry(telemetry);
        let now = ts(3, 9);
        let outcome = session
            .submit_at("ZoneA", &PredictionForm::default(), now)
            .unwrap();
        assert!((40.0..=80.0).contains(&outcome.predicted_energy));
        assert_eq!(outcome.chart.len(), 3);
        assert_eq!(outcome.chart[2].timestamp, now);
        assert_eq!(outcome.features.get("hvac"), Some(&1.0));
        assert_eq!(outcome.features.get("day_of_week_monday"), Some(&1.0));
        assert!(outcome.persisted.is_stored());
        assert!(outcome.history_error.is_none());

        let stored = store.load_interactive().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].predicted_energy, outcome.predicted_energy);
        assert_eq!(bus.of_type(EVENT_INTERACTIVE_PREDICTED).len(), 1);
    }

    #[test]
    fn failed_append_still_returns_prediction() {
        let inner = MemoryPredictionStore::new();
        inner
            .replace_batch(&[PredictionRecord::new(ts(1, 0), "ZoneA", 60.0)])
            .unwrap();
        let session = InteractiveSession::new(Arc::new(ReadOnlyStore(inner)), model());
        let outcome = session
            .submit_at("ZoneA", &PredictionForm::default(), ts(3, 9))
            .unwrap();
        assert!(matches!(outcome.persisted, PersistStatus::Failed(_)));
        assert_eq!(outcome.chart.len(), 2);
    }

    struct UnreadableStore(MemoryPredictionStore);

    impl PredictionStore for UnreadableStore {
        fn replace_batch(&self, records: &[PredictionRecord]) -> Result<usize, StoreError> {
            self.0.replace_batch(records)
        }

        fn load_batch(&self) -> Result<Vec<PredictionRecord>, StoreError> {
            Err(StoreError::Connection("offline".into()))
        }

        fn append_interactive(&self, prediction: &InteractivePrediction) -> Result<(), StoreError> {
            self.0.append_interactive(prediction)
        }

        fn load_interactive(&self) -> Result<Vec<InteractivePrediction>, StoreError> {
            self.0.load_interactive()
        }
    }

    #[test]
    fn failed_history_read_keeps_prediction() {
        let store = Arc::new(UnreadableStore(MemoryPredictionStore::new()));
        let sink = Arc::new(MemoryLogger::default());
        let telemetry = EnergyTelemetry::builder("energy")
            .log_sink(sink.clone())
            .build()
            .unwrap();
        let session = InteractiveSession::new(store.clone(), model()).with_telemetry(telemetry);
        let now = ts(3, 9);
        let outcome = session
            .submit_at("ZoneA", &PredictionForm::default(), now)
            .unwrap();

        assert!((40.0..=80.0).contains(&outcome.predicted_energy));
        assert_eq!(
            outcome.chart,
            vec![ChartPoint {
                timestamp: now,
                predicted_energy: outcome.predicted_energy,
            }]
        );
        assert!(outcome.history_error.as_deref().unwrap().contains("offline"));
        assert!(outcome.persisted.is_stored());
        assert_eq!(store.load_interactive().unwrap().len(), 1);
        assert!(sink.contains("energy.interactive.load_failed"));
    }

    #[test]
    fn invalid_form_is_rejected_before_prediction() {
        let store = seeded_store();
        let session = InteractiveSession::new(store.clone(), model());
        let form = PredictionForm {
            month: 13,
            ..PredictionForm::default()
        };
        let err = session.submit_at("ZoneA", &form, ts(3, 9)).unwrap_err();
        assert!(err.downcast_ref::<FormError>().is_some());
        assert!(store.load_interactive().unwrap().is_empty());
    }
}
