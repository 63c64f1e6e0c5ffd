#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! SQLite persistence gateway. Each operation acquires its own connection,
//! runs inside one transaction, and releases the connection on every path.

use std::{
    fmt,
    path::Path,
    str::FromStr,
};

use chrono::NaiveDateTime;
use energy_core::{
    record::{parse_weekday, weekday_name, TimeParts},
    EnergyTelemetry, InteractivePrediction, Observation, PredictionRecord, PredictionStore,
    StoreError, Switch,
};
use serde_json::json;
use shared_logging::LogLevel;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow},
    Connection, Row, Sqlite, Transaction,
};
use tokio::runtime::{Builder, Runtime};

/// Text layout of stored timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CREATE_BATCH_TABLE: &str = "
CREATE TABLE IF NOT EXISTS energy_predictions (
    timestamp TEXT NOT NULL,
    zone TEXT NOT NULL,
    predicted_energy REAL NOT NULL
)";

const CREATE_INTERACTIVE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS predictions_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    zone TEXT NOT NULL,
    temperature REAL NOT NULL,
    humidity REAL NOT NULL,
    square_footage REAL NOT NULL,
    occupancy REAL NOT NULL,
    hvac_usage INTEGER NOT NULL,
    lighting_usage INTEGER NOT NULL,
    renewable_energy REAL NOT NULL,
    holiday INTEGER NOT NULL,
    hour INTEGER NOT NULL,
    day INTEGER NOT NULL,
    month INTEGER NOT NULL,
    day_of_week TEXT NOT NULL,
    predicted_energy REAL NOT NULL
)";

const SELECT_BATCH: &str =
    "SELECT timestamp, zone, predicted_energy FROM energy_predictions";

const SELECT_INTERACTIVE: &str = "
SELECT zone, temperature, humidity, square_footage, occupancy, hvac_usage,
       lighting_usage, renewable_energy, holiday, hour, day, month, day_of_week,
       predicted_energy
FROM predictions_results ORDER BY id";

/// [`PredictionStore`] backed by a SQLite database file.
///
/// Calls block on a private runtime and must not be made from inside an
/// async task.
pub struct SqlitePredictionStore {
    options: SqliteConnectOptions,
    location: String,
    runtime: Runtime,
    telemetry: Option<EnergyTelemetry>,
}

impl fmt::Debug for SqlitePredictionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlitePredictionStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl SqlitePredictionStore {
    /// Store for a `sqlite://` URL. The file is created on first use.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| StoreError::Connection(format!("{url}: {err}")))?;
        Self::with_options(options, url.to_string())
    }

    /// Store for a database file path. The file is created on first use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new().filename(path);
        Self::with_options(options, path.display().to_string())
    }

    fn with_options(options: SqliteConnectOptions, location: String) -> Result<Self, StoreError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| StoreError::Runtime(err.to_string()))?;
        Ok(Self {
            options: options.create_if_missing(true),
            location,
            runtime,
            telemetry: None,
        })
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EnergyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Database location as given at construction.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    async fn acquire(&self) -> Result<SqliteConnection, StoreError> {
        let mut conn = SqliteConnection::connect_with(&self.options)
            .await
            .map_err(|err| {
                self.log(
                    LogLevel::Error,
                    "energy.store.connect_failed",
                    json!({ "location": self.location, "error": err.to_string() }),
                );
                StoreError::Connection(err.to_string())
            })?;
        let schema = async {
            sqlx::query(CREATE_BATCH_TABLE).execute(&mut conn).await?;
            sqlx::query(CREATE_INTERACTIVE_TABLE).execute(&mut conn).await?;
            Ok::<(), sqlx::Error>(())
        }
        .await;
        match schema {
            Ok(()) => Ok(conn),
            Err(err) => {
                let _ = conn.close().await;
                Err(StoreError::Connection(err.to_string()))
            }
        }
    }

    async fn release<T>(
        &self,
        conn: SqliteConnection,
        operation: &str,
        outcome: Result<T, sqlx::Error>,
    ) -> Result<T, StoreError> {
        if let Err(err) = conn.close().await {
            self.log(
                LogLevel::Warn,
                "energy.store.close_failed",
                json!({ "operation": operation, "error": err.to_string() }),
            );
        }
        outcome.map_err(|err| {
            self.log(
                LogLevel::Error,
                "energy.store.rolled_back",
                json!({ "operation": operation, "error": err.to_string() }),
            );
            StoreError::Query(err.to_string())
        })
    }

    fn fetch_batch(&self, filter: &str, binds: &[String]) -> Result<Vec<PredictionRecord>, StoreError> {
        let sql = format!("{SELECT_BATCH} {filter} ORDER BY rowid");
        let rows = self.runtime.block_on(async {
            let mut conn = self.acquire().await?;
            let outcome = select_rows(&mut conn, &sql, binds).await;
            self.release(conn, "load_batch", outcome).await
        })?;
        rows.iter().map(decode_batch_row).collect()
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

async fn finish<T>(
    tx: Transaction<'_, Sqlite>,
    outcome: Result<T, sqlx::Error>,
) -> Result<T, sqlx::Error> {
    match outcome {
        Ok(value) => tx.commit().await.map(|()| value),
        Err(err) => {
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

async fn replace_rows(
    conn: &mut SqliteConnection,
    records: &[PredictionRecord],
) -> Result<usize, sqlx::Error> {
    let mut tx = conn.begin().await?;
    let outcome = async {
        sqlx::query("DELETE FROM energy_predictions")
            .execute(&mut *tx)
            .await?;
        for record in records {
            sqlx::query(
                "INSERT INTO energy_predictions (timestamp, zone, predicted_energy) VALUES (?, ?, ?)",
            )
            .bind(record.timestamp.format(TIMESTAMP_FORMAT).to_string())
            .bind(&record.zone)
            .bind(record.predicted_energy)
            .execute(&mut *tx)
            .await?;
        }
        Ok::<usize, sqlx::Error>(records.len())
    };
    let outcome = outcome.await;
    finish(tx, outcome).await
}

async fn insert_interactive(
    conn: &mut SqliteConnection,
    prediction: &InteractivePrediction,
) -> Result<(), sqlx::Error> {
    let observation = &prediction.observation;
    let mut tx = conn.begin().await?;
    let outcome = sqlx::query(
        "INSERT INTO predictions_results (
            zone, temperature, humidity, square_footage, occupancy, hvac_usage,
            lighting_usage, renewable_energy, holiday, hour, day, month, day_of_week,
            predicted_energy
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&prediction.zone)
    .bind(observation.temperature)
    .bind(observation.humidity)
    .bind(observation.square_footage)
    .bind(observation.occupancy)
    .bind(observation.hvac.as_flag())
    .bind(observation.lighting.as_flag())
    .bind(observation.renewable_energy)
    .bind(i64::from(observation.holiday))
    .bind(i64::from(observation.time.hour))
    .bind(i64::from(observation.time.day))
    .bind(i64::from(observation.time.month))
    .bind(weekday_name(observation.day_of_week))
    .bind(prediction.predicted_energy)
    .execute(&mut *tx)
    .await
    .map(|_| ());
    finish(tx, outcome).await
}

async fn select_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    binds: &[String],
) -> Result<Vec<SqliteRow>, sqlx::Error> {
    let mut tx = conn.begin().await?;
    let mut query = sqlx::query(sql);
    for value in binds {
        query = query.bind(value);
    }
    let outcome = query.fetch_all(&mut *tx).await;
    finish(tx, outcome).await
}

fn decode_err(err: impl fmt::Display) -> StoreError {
    StoreError::Decode(err.to_string())
}

fn decode_batch_row(row: &SqliteRow) -> Result<PredictionRecord, StoreError> {
    let raw: String = row.try_get("timestamp").map_err(decode_err)?;
    let timestamp = NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
        .map_err(|err| decode_err(format!("timestamp {raw:?}: {err}")))?;
    Ok(PredictionRecord {
        timestamp,
        zone: row.try_get("zone").map_err(decode_err)?,
        predicted_energy: row.try_get("predicted_energy").map_err(decode_err)?,
    })
}

fn small_int(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column).map_err(decode_err)?;
    u32::try_from(value).map_err(|_| decode_err(format!("{column} = {value}")))
}

fn decode_interactive_row(row: &SqliteRow) -> Result<InteractivePrediction, StoreError> {
    let time = TimeParts::new(
        small_int(row, "hour")?,
        small_int(row, "day")?,
        small_int(row, "month")?,
    )
    .map_err(decode_err)?;
    let day: String = row.try_get("day_of_week").map_err(decode_err)?;
    let observation = Observation {
        temperature: row.try_get("temperature").map_err(decode_err)?,
        humidity: row.try_get("humidity").map_err(decode_err)?,
        square_footage: row.try_get("square_footage").map_err(decode_err)?,
        occupancy: row.try_get("occupancy").map_err(decode_err)?,
        hvac: Switch::from_flag(row.try_get("hvac_usage").map_err(decode_err)?),
        lighting: Switch::from_flag(row.try_get("lighting_usage").map_err(decode_err)?),
        renewable_energy: row.try_get("renewable_energy").map_err(decode_err)?,
        holiday: row.try_get::<i64, _>("holiday").map_err(decode_err)? != 0,
        time,
        day_of_week: parse_weekday(&day).map_err(decode_err)?,
    };
    Ok(InteractivePrediction {
        zone: row.try_get("zone").map_err(decode_err)?,
        observation,
        predicted_energy: row.try_get("predicted_energy").map_err(decode_err)?,
    })
}

impl PredictionStore for SqlitePredictionStore {
    fn replace_batch(&self, records: &[PredictionRecord]) -> Result<usize, StoreError> {
        let inserted = self.runtime.block_on(async {
            let mut conn = self.acquire().await?;
            let outcome = replace_rows(&mut conn, records).await;
            self.release(conn, "replace_batch", outcome).await
        })?;
        self.log(
            LogLevel::Debug,
            "energy.store.replaced",
            json!({ "location": self.location, "rows": inserted }),
        );
        Ok(inserted)
    }

    fn load_batch(&self) -> Result<Vec<PredictionRecord>, StoreError> {
        self.fetch_batch("", &[])
    }

    fn append_interactive(&self, prediction: &InteractivePrediction) -> Result<(), StoreError> {
        self.runtime.block_on(async {
            let mut conn = self.acquire().await?;
            let outcome = insert_interactive(&mut conn, prediction).await;
            self.release(conn, "append_interactive", outcome).await
        })
    }

    fn load_interactive(&self) -> Result<Vec<InteractivePrediction>, StoreError> {
        let rows = self.runtime.block_on(async {
            let mut conn = self.acquire().await?;
            let outcome = select_rows(&mut conn, SELECT_INTERACTIVE, &[]).await;
            self.release(conn, "load_interactive", outcome).await
        })?;
        rows.iter().map(decode_interactive_row).collect()
    }

    fn load_zone(&self, zone: &str) -> Result<Vec<PredictionRecord>, StoreError> {
        self.fetch_batch("WHERE zone = ?", &[zone.to_string()])
    }

    fn find(
        &self,
        timestamp: NaiveDateTime,
        zone: &str,
    ) -> Result<Option<PredictionRecord>, StoreError> {
        let mut found = self.fetch_batch(
            "WHERE timestamp = ? AND zone = ?",
            &[timestamp.format(TIMESTAMP_FORMAT).to_string(), zone.to_string()],
        )?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    fn zones(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.runtime.block_on(async {
            let mut conn = self.acquire().await?;
            let outcome = select_rows(
                &mut conn,
                "SELECT zone FROM energy_predictions GROUP BY zone ORDER BY MIN(rowid)",
                &[],
            )
            .await;
            self.release(conn, "zones", outcome).await
        })?;
        rows.iter()
            .map(|row| row.try_get("zone").map_err(decode_err))
            .collect()
    }
}
