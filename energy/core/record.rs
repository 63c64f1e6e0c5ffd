use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::encoder::{parse_timestamp, EncodingError};

/// Day-of-week categories in schema order.
pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Full English name used by the input file and the form.
#[must_use]
pub const fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Maps a full day name onto a weekday. Abbreviations are rejected.
pub fn parse_weekday(raw: &str) -> Result<Weekday, EncodingError> {
    let raw = raw.trim();
    WEEKDAYS
        .into_iter()
        .find(|day| weekday_name(*day) == raw)
        .ok_or_else(|| EncodingError::UnknownCategory {
            field: "DayOfWeek",
            value: raw.to_string(),
            allowed: "Monday..Sunday",
        })
}

/// One row of the input file, as read. Categorical fields stay textual
/// until they are encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Observation time as written in the file.
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    /// Outdoor temperature (°C).
    #[serde(rename = "Temperature")]
    pub temperature: f64,
    /// Relative humidity (%).
    #[serde(rename = "Humidity")]
    pub humidity: f64,
    /// Floor area.
    #[serde(rename = "SquareFootage")]
    pub square_footage: f64,
    /// People present.
    #[serde(rename = "Occupancy")]
    pub occupancy: f64,
    /// `On` / `Off`.
    #[serde(rename = "HVACUsage")]
    pub hvac_usage: String,
    /// `On` / `Off`.
    #[serde(rename = "LightingUsage")]
    pub lighting_usage: String,
    /// Renewable energy generated (kWh).
    #[serde(rename = "RenewableEnergy")]
    pub renewable_energy: f64,
    /// `Monday` .. `Sunday`.
    #[serde(rename = "DayOfWeek")]
    pub day_of_week: String,
    /// `Yes` / `No`.
    #[serde(rename = "Holiday")]
    pub holiday: String,
    /// Measured consumption; absent for records that still need a prediction.
    #[serde(rename = "EnergyConsumption", default)]
    pub energy_consumption: Option<f64>,
}

/// Binary usage flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Switch {
    /// Equipment running.
    On,
    /// Equipment idle.
    Off,
}

impl Switch {
    /// Parses the `On`/`Off` dictionary for the named field.
    pub fn parse(field: &'static str, raw: &str) -> Result<Self, EncodingError> {
        match raw.trim() {
            "On" => Ok(Self::On),
            "Off" => Ok(Self::Off),
            other => Err(EncodingError::UnknownCategory {
                field,
                value: other.to_string(),
                allowed: "On, Off",
            }),
        }
    }

    /// `1.0` when on.
    #[must_use]
    pub const fn indicator(self) -> f64 {
        match self {
            Self::On => 1.0,
            Self::Off => 0.0,
        }
    }

    /// Stored integer form.
    #[must_use]
    pub const fn as_flag(self) -> i64 {
        match self {
            Self::On => 1,
            Self::Off => 0,
        }
    }

    /// Inverse of [`Switch::as_flag`]; any non-zero value is `On`.
    #[must_use]
    pub const fn from_flag(flag: i64) -> Self {
        if flag == 0 {
            Self::Off
        } else {
            Self::On
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "On",
            Self::Off => "Off",
        })
    }
}

/// Parses the `Yes`/`No` holiday dictionary.
pub fn parse_holiday(raw: &str) -> Result<bool, EncodingError> {
    match raw.trim() {
        "Yes" => Ok(true),
        "No" => Ok(false),
        other => Err(EncodingError::UnknownCategory {
            field: "Holiday",
            value: other.to_string(),
            allowed: "Yes, No",
        }),
    }
}

/// Calendar fields derived from a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeParts {
    /// 0..=23
    pub hour: u32,
    /// 1..=31
    pub day: u32,
    /// 1..=12
    pub month: u32,
}

impl TimeParts {
    /// Validates explicit parts, as entered on the prediction form.
    pub fn new(hour: u32, day: u32, month: u32) -> Result<Self, EncodingError> {
        check_range("hour", hour, 0, 23)?;
        check_range("day", day, 1, 31)?;
        check_range("month", month, 1, 12)?;
        Ok(Self { hour, day, month })
    }

    /// Extracts hour, day-of-month and month.
    #[must_use]
    pub fn from_timestamp(timestamp: &NaiveDateTime) -> Self {
        Self {
            hour: timestamp.hour(),
            day: timestamp.day(),
            month: timestamp.month(),
        }
    }
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), EncodingError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(EncodingError::OutOfRange {
            field,
            value: f64::from(value),
            min: f64::from(min),
            max: f64::from(max),
        })
    }
}

/// Typed inputs of one prediction, without the target. Every feature row is
/// built from one of these.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Outdoor temperature (°C).
    pub temperature: f64,
    /// Relative humidity (%).
    pub humidity: f64,
    /// Floor area.
    pub square_footage: f64,
    /// People present.
    pub occupancy: f64,
    /// HVAC state.
    pub hvac: Switch,
    /// Lighting state.
    pub lighting: Switch,
    /// Renewable energy generated (kWh).
    pub renewable_energy: f64,
    /// Holiday flag.
    pub holiday: bool,
    /// Hour, day and month.
    pub time: TimeParts,
    /// Day-of-week label, independent of the date.
    pub day_of_week: Weekday,
}

impl Observation {
    /// Parses and validates a raw record.
    pub fn from_raw(raw: &RawRecord) -> Result<(NaiveDateTime, Self), EncodingError> {
        let timestamp = parse_timestamp(&raw.timestamp)?;
        let observation = Self {
            temperature: finite("Temperature", raw.temperature)?,
            humidity: finite("Humidity", raw.humidity)?,
            square_footage: finite("SquareFootage", raw.square_footage)?,
            occupancy: finite("Occupancy", raw.occupancy)?,
            hvac: Switch::parse("HVACUsage", &raw.hvac_usage)?,
            lighting: Switch::parse("LightingUsage", &raw.lighting_usage)?,
            renewable_energy: finite("RenewableEnergy", raw.renewable_energy)?,
            holiday: parse_holiday(&raw.holiday)?,
            time: TimeParts::from_timestamp(&timestamp),
            day_of_week: parse_weekday(&raw.day_of_week)?,
        };
        Ok((timestamp, observation))
    }
}

fn finite(field: &'static str, value: f64) -> Result<f64, EncodingError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EncodingError::InvalidNumber { field })
    }
}

/// Batch prediction row stored in `energy_predictions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Observation time.
    pub timestamp: NaiveDateTime,
    /// Zone identifier.
    pub zone: String,
    /// Model output.
    pub predicted_energy: f64,
}

impl PredictionRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(timestamp: NaiveDateTime, zone: impl Into<String>, predicted_energy: f64) -> Self {
        Self {
            timestamp,
            zone: zone.into(),
            predicted_energy,
        }
    }
}

/// Single-record prediction stored in `predictions_results`.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractivePrediction {
    /// Zone selected on the dashboard.
    pub zone: String,
    /// Submitted inputs.
    pub observation: Observation,
    /// Model output.
    pub predicted_energy: f64,
}
