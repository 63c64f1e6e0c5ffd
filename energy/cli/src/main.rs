mod render;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Weekday;
use clap::{Parser, Subcommand, ValueEnum};
use energy_core::{
    olap_from_store, BatchPipeline, EnergyConfig, EnergyTelemetry, InteractiveSession,
    ModelLifecycle, PredictionForm, PredictionStore, Switch,
};
use energy_gateway::SqlitePredictionStore;
use serde_json::json;
use shared_logging::LogLevel;

const DEFAULT_CONFIG: &str = "energy.toml";
const CHART_WIDTH: usize = 72;

#[derive(Parser, Debug)]
#[command(name = "energy", version, about = "Building energy consumption predictor")]
struct Cli {
    /// Configuration file; `energy.toml` is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fits on the historical file, predicts every record and stores the results.
    Batch {
        /// Overrides `[data].csv_path`.
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Overrides `[data].zone`.
        #[arg(long)]
        zone: Option<String>,
        /// Rows shown per slice and dice.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Prints the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Roll-up, drill-down, slice, dice and pivot over stored predictions.
    Olap {
        /// Rows shown per slice and dice.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Prints the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Lists zones with stored predictions.
    Zones,
    /// Chart and preview for one zone.
    Dashboard {
        /// Zone to display; the first stored zone when omitted.
        #[arg(long)]
        zone: Option<String>,
        /// Preview rows.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Predicts consumption for one set of inputs and stores the result.
    Predict(PredictArgs),
}

#[derive(Parser, Debug)]
struct PredictArgs {
    /// Zone the prediction is filed under; the first stored zone when omitted.
    #[arg(long)]
    zone: Option<String>,
    /// Temperature (°C), 0 to 50.
    #[arg(long, default_value_t = 25.0)]
    temperature: f64,
    /// Humidity (%), 0 to 100.
    #[arg(long, default_value_t = 50.0)]
    humidity: f64,
    /// Square footage, 100 to 10000.
    #[arg(long, default_value_t = 1000.0)]
    square_footage: f64,
    /// Occupancy, 0 to 1000.
    #[arg(long, default_value_t = 10)]
    occupancy: u32,
    /// HVAC usage.
    #[arg(long, value_enum, default_value_t = OnOff::On)]
    hvac: OnOff,
    /// Lighting usage.
    #[arg(long, value_enum, default_value_t = OnOff::On)]
    lighting: OnOff,
    /// Renewable energy generated (kWh).
    #[arg(long, default_value_t = 5.0)]
    renewable: f64,
    /// Holiday.
    #[arg(long, value_enum, default_value_t = YesNo::No)]
    holiday: YesNo,
    /// Hour of day, 0 to 23.
    #[arg(long, default_value_t = 12)]
    hour: u32,
    /// Day of month, 1 to 31.
    #[arg(long, default_value_t = 15)]
    day: u32,
    /// Month, 1 to 12.
    #[arg(long, default_value_t = 6)]
    month: u32,
    /// Day of week.
    #[arg(long, value_enum, default_value_t = Day::Monday)]
    day_of_week: Day,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "PascalCase")]
enum OnOff {
    On,
    Off,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "PascalCase")]
enum YesNo {
    Yes,
    No,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "PascalCase")]
enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<OnOff> for Switch {
    fn from(value: OnOff) -> Self {
        match value {
            OnOff::On => Self::On,
            OnOff::Off => Self::Off,
        }
    }
}

impl From<Day> for Weekday {
    fn from(value: Day) -> Self {
        match value {
            Day::Monday => Self::Mon,
            Day::Tuesday => Self::Tue,
            Day::Wednesday => Self::Wed,
            Day::Thursday => Self::Thu,
            Day::Friday => Self::Fri,
            Day::Saturday => Self::Sat,
            Day::Sunday => Self::Sun,
        }
    }
}

impl PredictArgs {
    fn form(&self) -> PredictionForm {
        PredictionForm {
            temperature: self.temperature,
            humidity: self.humidity,
            square_footage: self.square_footage,
            occupancy: self.occupancy,
            hvac: self.hvac.into(),
            lighting: self.lighting.into(),
            renewable_energy: self.renewable,
            holiday: matches!(self.holiday, YesNo::Yes),
            hour: self.hour,
            day: self.day,
            month: self.month,
            day_of_week: self.day_of_week.into(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let telemetry = EnergyTelemetry::from_settings("energy", &config.telemetry)
        .context("initialising telemetry")?;
    match cli.command {
        Commands::Batch {
            csv,
            zone,
            limit,
            json,
        } => handle_batch(config, telemetry, csv, zone, limit, json),
        Commands::Olap { limit, json } => {
            let store = dashboard_store(&config, &telemetry)?;
            let report = olap_from_store(store.as_ref(), &config.olap)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render::olap(&report, &config.olap, limit));
            }
            Ok(())
        }
        Commands::Zones => {
            let store = dashboard_store(&config, &telemetry)?;
            for zone in store.zones()? {
                println!("{zone}");
            }
            Ok(())
        }
        Commands::Dashboard { zone, limit } => {
            let store = dashboard_store(&config, &telemetry)?;
            let Some(zone) = pick_zone(store.as_ref(), zone)? else {
                println!("{}", energy_core::session::EMPTY_ZONE_NOTICE);
                return Ok(());
            };
            let session = open_session(&config, &telemetry, store)?;
            println!(
                "{}",
                render::zone_view(&session.zone_view(&zone)?, limit, CHART_WIDTH)
            );
            Ok(())
        }
        Commands::Predict(args) => {
            let store = dashboard_store(&config, &telemetry)?;
            let zone = prediction_zone(
                store.as_ref(),
                args.zone.clone(),
                &config.data.zone,
                &telemetry,
            );
            let session = open_session(&config, &telemetry, store)?;
            let outcome = session.submit(&zone, &args.form())?;
            println!("{}", render::prediction(&outcome, CHART_WIDTH));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EnergyConfig> {
    match path {
        Some(path) => EnergyConfig::load(path),
        None if Path::new(DEFAULT_CONFIG).exists() => EnergyConfig::load(DEFAULT_CONFIG),
        None => Ok(EnergyConfig::default()),
    }
}

fn handle_batch(
    mut config: EnergyConfig,
    telemetry: EnergyTelemetry,
    csv: Option<PathBuf>,
    zone: Option<String>,
    limit: usize,
    json: bool,
) -> Result<()> {
    if let Some(csv) = csv {
        config.data.csv_path = csv;
    }
    if let Some(zone) = zone {
        config.data.zone = zone;
    }
    let store = SqlitePredictionStore::connect(&config.store.batch_url)
        .with_context(|| format!("opening {}", config.store.batch_url))?
        .with_telemetry(telemetry.clone());
    let olap_params = config.olap.clone();
    let report = BatchPipeline::new(config, Arc::new(store))
        .with_telemetry(telemetry)
        .run()?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "run_id": report.run_id,
                "model_id": report.model_id,
                "rows": report.rows,
                "evaluation": report.evaluation,
                "artifact_saved": report.artifact_saved,
                "stored": report.persisted.is_stored(),
                "olap": report.olap,
            }))?
        );
    } else {
        println!("{}", render::batch(&report));
        println!();
        println!("{}", render::olap(&report.olap, &olap_params, limit));
    }
    Ok(())
}

fn dashboard_store(
    config: &EnergyConfig,
    telemetry: &EnergyTelemetry,
) -> Result<Arc<dyn PredictionStore>> {
    let store = SqlitePredictionStore::connect(&config.store.dashboard_url)
        .with_context(|| format!("opening {}", config.store.dashboard_url))?
        .with_telemetry(telemetry.clone());
    Ok(Arc::new(store))
}

fn pick_zone(store: &dyn PredictionStore, requested: Option<String>) -> Result<Option<String>> {
    if requested.is_some() {
        return Ok(requested);
    }
    Ok(store.zones()?.into_iter().next())
}

/// Zone a prediction is filed under. An unreadable store falls back to the
/// configured zone so the prediction still runs.
fn prediction_zone(
    store: &dyn PredictionStore,
    requested: Option<String>,
    fallback: &str,
    telemetry: &EnergyTelemetry,
) -> String {
    match pick_zone(store, requested) {
        Ok(zone) => zone.unwrap_or_else(|| fallback.to_string()),
        Err(err) => {
            let _ = telemetry.log(
                LogLevel::Warn,
                "energy.session.zones_unavailable",
                json!({ "error": format!("{err:#}"), "fallback": fallback }),
            );
            fallback.to_string()
        }
    }
}

fn open_session(
    config: &EnergyConfig,
    telemetry: &EnergyTelemetry,
    store: Arc<dyn PredictionStore>,
) -> Result<InteractiveSession> {
    let served = ModelLifecycle::new(config)?
        .with_telemetry(telemetry.clone())
        .load_or_train()?;
    let _ = telemetry.log(
        LogLevel::Info,
        "energy.session.opened",
        json!({ "model_id": served.model.id(), "source": format!("{:?}", served.source) }),
    );
    Ok(InteractiveSession::new(store, served.model).with_telemetry(telemetry.clone()))
}
