//! Structured logs and pipeline events for the energy runtimes.

use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use tokio::runtime::{Handle, Runtime};

use crate::config::TelemetrySettings;

/// Event emitted once the historical records are loaded and encoded.
pub const EVENT_BATCH_LOADED: &str = "energy.batch.loaded";
/// Event emitted after the model is fitted.
pub const EVENT_BATCH_TRAINED: &str = "energy.batch.trained";
/// Event emitted after batch predictions are stored.
pub const EVENT_BATCH_PERSISTED: &str = "energy.batch.persisted";
/// Event emitted when storing batch predictions failed.
pub const EVENT_BATCH_PERSIST_FAILED: &str = "energy.batch.persist_failed";
/// Event emitted for every interactive prediction.
pub const EVENT_INTERACTIVE_PREDICTED: &str = "energy.interactive.predicted";

/// Builder configuring telemetry for batch and interactive runs.
pub struct EnergyTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    log_sink: Option<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl EnergyTelemetryBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            log_sink: None,
            event_publisher: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the minimum level written to the JSON log.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Routes records to a custom sink instead of a log file.
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Assigns the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<EnergyTelemetry> {
        let sink: Option<Arc<dyn LogSink>> = match (self.log_sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(Arc::new(JsonLogger::with_min_level(
                path,
                self.min_level,
            )?)),
            (None, None) => None,
        };
        let event = match self.event_publisher {
            Some(publisher) => Some(EventHandle::new(publisher)?),
            None => None,
        };
        Ok(EnergyTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sink,
                event,
            }),
        })
    }
}

/// Telemetry handle shared by the batch pipeline and interactive sessions.
#[derive(Clone)]
pub struct EnergyTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for EnergyTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyTelemetry")
            .field("module", &self.inner.module)
            .field("logs", &self.inner.sink.is_some())
            .field("events", &self.inner.event.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sink: Option<Arc<dyn LogSink>>,
    event: Option<EventHandle>,
}

struct EventHandle {
    runtime: Runtime,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime, publisher })
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(record))
        }
    }
}

impl EnergyTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EnergyTelemetryBuilder {
        EnergyTelemetryBuilder::new(module)
    }

    /// Builds telemetry from the `[telemetry]` config section. Missing paths
    /// disable the corresponding sink.
    pub fn from_settings(module: impl Into<String>, settings: &TelemetrySettings) -> Result<Self> {
        let mut builder = Self::builder(module).min_level(settings.min_level);
        if let Some(path) = &settings.log_path {
            builder = builder.log_path(path);
        }
        if let Some(path) = &settings.event_log {
            builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
        }
        builder.build()
    }

    /// Telemetry that records nothing.
    #[must_use]
    pub fn disabled(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                sink: None,
                event: None,
            }),
        }
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(sink) = &self.inner.sink {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Emits an event entry via the configured bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(EventRecord::new(&self.inner.module, event_type, payload))?;
        }
        Ok(())
    }
}
