use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, PipelineStage, StageEvent};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};
use uuid::Uuid;

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    module: String,
    run_id: Option<String>,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            run_id: None,
            log_path: None,
            min_level: LogLevel::Info,
            event_publisher: None,
        }
    }

    /// Pins the run id stamped on events (a fresh one is generated otherwise).
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        let event = match self.event_publisher {
            Some(publisher) => Some(EventHandle::new(publisher)?),
            None => None,
        };
        Ok(PipelineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                run_id: self
                    .run_id
                    .unwrap_or_else(|| format!("run-{}", Uuid::new_v4())),
                logger,
                event,
            }),
        })
    }
}

/// Telemetry handle shared across pipeline stages.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("module", &self.inner.module)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    run_id: String,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

struct EventHandle {
    runtime: Runtime,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        Ok(Self {
            runtime: Runtime::new()?,
            publisher,
        })
    }

    fn publish(&self, event: StageEvent) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(event).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(event))
        }
    }
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(module)
    }

    /// Telemetry with no sinks; every call is a no-op.
    #[must_use]
    pub fn disabled(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                run_id: format!("run-{}", Uuid::new_v4()),
                logger: None,
                event: None,
            }),
        }
    }

    /// Run id stamped on emitted events.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let metadata = match metadata {
                Value::Object(mut obj) => {
                    obj.insert("run_id".into(), Value::from(self.inner.run_id.as_str()));
                    Value::Object(obj)
                }
                other => other,
            };
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits a stage event on the bus.
    pub fn event(&self, stage: PipelineStage, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(StageEvent::new(
                self.inner.run_id.as_str(),
                self.inner.module.as_str(),
                stage,
                payload,
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_filtered_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("pipeline.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = PipelineTelemetry::builder("reorder.features")
            .run_id("run-test")
            .log_path(&path)
            .min_level(LogLevel::Info)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "features.shard", json!({ "shard": 0 }))
            .unwrap();
        telemetry
            .log(LogLevel::Info, "features.assembled", json!({ "rows": 3 }))
            .unwrap();
        telemetry
            .event(PipelineStage::FeaturesAssembled, json!({ "rows": 3 }))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("features.assembled"));
        assert!(content.contains("run-test"));
        assert!(!content.contains("features.shard"));
        let events = bus.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].run_id, "run-test");
        assert_eq!(events[0].stage, PipelineStage::FeaturesAssembled);
    }

    #[test]
    fn disabled_telemetry_is_silent() {
        let telemetry = PipelineTelemetry::disabled("reorder.features");
        assert!(telemetry
            .log(LogLevel::Error, "ignored", json!({}))
            .is_ok());
        assert!(telemetry
            .event(PipelineStage::RunFailed, json!({}))
            .is_ok());
        assert!(telemetry.run_id().starts_with("run-"));
    }
}
