#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Stage events emitted by the reorder pipeline, with in-memory and file-backed publishers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// Pipeline stage that produced an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// The five input relations were loaded.
    RelationsLoaded,
    /// The feature table was assembled (or served from cache).
    FeaturesAssembled,
    /// Scaler parameters were fitted.
    ScalerFitted,
    /// The scoring model finished training.
    ModelTrained,
    /// Validation metrics were computed.
    ModelEvaluated,
    /// A (user, product) pair was scored.
    ScoreServed,
    /// A run aborted with a fatal condition.
    RunFailed,
}

impl PipelineStage {
    /// Dotted topic name used in logs and event files.
    #[must_use]
    pub const fn topic(self) -> &'static str {
        match self {
            Self::RelationsLoaded => "relations.loaded",
            Self::FeaturesAssembled => "features.assembled",
            Self::ScalerFitted => "scaler.fitted",
            Self::ModelTrained => "model.trained",
            Self::ModelEvaluated => "model.evaluated",
            Self::ScoreServed => "score.served",
            Self::RunFailed => "run.failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// Event record encoded as one JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// Unique identifier (`evt-<uuid>`).
    pub id: String,
    /// Pipeline run the event belongs to.
    pub run_id: String,
    /// Component producing the event.
    pub source: String,
    /// Stage reached.
    pub stage: PipelineStage,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Stage-specific payload (row counts, metrics, error text).
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StageEvent {
    /// Builds an event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        source: impl Into<String>,
        stage: PipelineStage,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            run_id: run_id.into(),
            source: source.into(),
            stage,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event.
    async fn publish(&self, event: StageEvent) -> Result<()>;
}

/// Event subscriber interface.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Returns a receiver for events published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<StageEvent>>;
}

/// In-memory broadcast bus keeping a bounded backlog (local runs and tests).
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<StageEvent>,
    backlog: Arc<Mutex<VecDeque<StageEvent>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a new bus retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Snapshot of retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StageEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events for a single stage, oldest first.
    #[must_use]
    pub fn by_stage(&self, stage: PipelineStage) -> Vec<StageEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.stage == stage)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: StageEvent) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(event.clone());
        }
        // No live subscribers is not an error; the backlog still holds the event.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for MemoryEventBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<StageEvent>> {
        Ok(self.sender.subscribe())
    }
}

/// Publisher appending events as JSON lines to a file.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher for `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Returns the event file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every event recorded for `run_id`, in file order.
    pub fn read_run(&self, run_id: &str) -> Result<Vec<StageEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading event log {}", self.path.display()))?;
        let mut events = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let event: StageEvent =
                serde_json::from_str(line).context("failed to deserialize stage event")?;
            if event.run_id == run_id {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: StageEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    fn assembled(run_id: &str) -> StageEvent {
        StageEvent::new(
            run_id,
            "features",
            PipelineStage::FeaturesAssembled,
            json!({ "rows": 3 }),
        )
    }

    #[test]
    fn memory_bus_broadcasts_to_subscribers() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(16);
            let mut rx = bus.subscribe().await.unwrap();
            bus.publish(assembled("run-1")).await.unwrap();
            let event = rx.recv().await.unwrap();
            assert_eq!(event.stage, PipelineStage::FeaturesAssembled);
            assert_eq!(event.payload["rows"], 3);
        });
    }

    #[test]
    fn memory_bus_backlog_is_bounded() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(2);
            for run in ["a", "b", "c"] {
                bus.publish(assembled(run)).await.unwrap();
            }
            let retained: Vec<_> = bus.snapshot().into_iter().map(|e| e.run_id).collect();
            assert_eq!(retained, vec!["b".to_string(), "c".to_string()]);
            assert_eq!(bus.by_stage(PipelineStage::ScalerFitted).len(), 0);
        });
    }

    #[test]
    fn file_publisher_round_trips_runs() {
        let rt = Runtime::new().unwrap();
        let dir = tempdir().unwrap();
        let publisher = FileEventPublisher::new(dir.path().join("events/stages.jsonl")).unwrap();
        rt.block_on(async {
            publisher.publish(assembled("run-1")).await.unwrap();
            publisher.publish(assembled("run-2")).await.unwrap();
            publisher
                .publish(StageEvent::new(
                    "run-1",
                    "scaler",
                    PipelineStage::ScalerFitted,
                    json!({}),
                ))
                .await
                .unwrap();
        });
        let events = publisher.read_run("run-1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].stage.topic(), "scaler.fitted");
    }
}
