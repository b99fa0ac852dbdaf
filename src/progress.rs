//! Live progress feed for a reconciliation run.
//!
//! Batch workers run in parallel, so events are funneled through a single
//! writer task fed by an unbounded channel; the sink only ever sees one
//! append at a time per run. Emitting to a closed channel is silently
//! ignored, mirroring how the run must never fail because nobody is
//! listening.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::schema::ReconcileStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Analyze,
    Search,
    Match,
    Fx,
    Confirm,
    Classify,
    Escalate,
    Learn,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub step: String,
    pub message: String,
}

/// Append-only event log for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressLog {
    pub run_id: String,
    pub events: Vec<ProgressEvent>,
    pub status: RunStatus,
    pub stats: Option<ReconcileStats>,
}

/// Where serialized events land: a database row, a websocket fan-out, or the
/// in-memory log below.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn append(&self, run_id: &str, event: ProgressEvent) -> Result<()>;
    async fn finish(&self, run_id: &str, status: RunStatus, stats: &ReconcileStats) -> Result<()>;
}

/// In-memory sink with a readable live feed, used by tests and demos.
#[derive(Default)]
pub struct InMemoryProgress {
    logs: Mutex<HashMap<String, ProgressLog>>,
}

impl InMemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, run_id: &str) -> Option<ProgressLog> {
        self.logs.lock().expect("progress lock poisoned").get(run_id).cloned()
    }
}

#[async_trait]
impl ProgressSink for InMemoryProgress {
    async fn append(&self, run_id: &str, event: ProgressEvent) -> Result<()> {
        let mut logs = self.logs.lock().expect("progress lock poisoned");
        let log = logs.entry(run_id.to_string()).or_insert_with(|| ProgressLog {
            run_id: run_id.to_string(),
            events: Vec::new(),
            status: RunStatus::Running,
            stats: None,
        });
        log.events.push(event);
        Ok(())
    }

    async fn finish(&self, run_id: &str, status: RunStatus, stats: &ReconcileStats) -> Result<()> {
        let mut logs = self.logs.lock().expect("progress lock poisoned");
        let log = logs.entry(run_id.to_string()).or_insert_with(|| ProgressLog {
            run_id: run_id.to_string(),
            events: Vec::new(),
            status: RunStatus::Running,
            stats: None,
        });
        log.status = status;
        log.stats = Some(stats.clone());
        Ok(())
    }
}

enum WriterMessage {
    Event(ProgressEvent),
    Finish(RunStatus, ReconcileStats),
}

/// Cheap clonable handle the orchestrator and batch workers emit through.
#[derive(Clone)]
pub struct ProgressRecorder {
    sender: Option<UnboundedSender<WriterMessage>>,
}

impl ProgressRecorder {
    /// A recorder that drops everything, for callers without a sink.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Spawn the single writer task for `run_id` on `sink` and return the
    /// emit handle plus the writer's join handle.
    pub fn start(run_id: String, sink: Arc<dyn ProgressSink>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WriterMessage>();
        let handle = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    WriterMessage::Event(event) => {
                        if let Err(e) = sink.append(&run_id, event).await {
                            log::warn!("progress append failed for run {}: {}", run_id, e);
                        }
                    }
                    WriterMessage::Finish(status, stats) => {
                        if let Err(e) = sink.finish(&run_id, status, &stats).await {
                            log::warn!("progress finish failed for run {}: {}", run_id, e);
                        }
                        break;
                    }
                }
            }
        });
        (Self { sender: Some(sender) }, handle)
    }

    pub fn emit(&self, category: EventCategory, step: &str, message: impl Into<String>) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(WriterMessage::Event(ProgressEvent {
                timestamp: Utc::now(),
                category,
                step: step.to_string(),
                message: message.into(),
            }));
        }
    }

    pub fn finish(&self, status: RunStatus, stats: &ReconcileStats) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(WriterMessage::Finish(status, stats.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_serialized_through_single_writer() {
        let sink = Arc::new(InMemoryProgress::new());
        let (recorder, writer) = ProgressRecorder::start("run-1".to_string(), sink.clone());

        // Emit from several clones as parallel workers would.
        let mut workers = Vec::new();
        for i in 0..4 {
            let r = recorder.clone();
            workers.push(tokio::spawn(async move {
                for j in 0..10 {
                    r.emit(EventCategory::Info, "ai_matching", format!("w{} e{}", i, j));
                }
            }));
        }
        for w in workers {
            w.await.unwrap();
        }
        recorder.finish(RunStatus::Completed, &ReconcileStats::default());
        writer.await.unwrap();

        let log = sink.snapshot("run-1").unwrap();
        assert_eq!(log.events.len(), 40);
        assert_eq!(log.status, RunStatus::Completed);
        assert!(log.stats.is_some());
    }

    #[tokio::test]
    async fn test_disabled_recorder_is_noop() {
        let recorder = ProgressRecorder::disabled();
        recorder.emit(EventCategory::Info, "quick_scan", "nothing listens");
        recorder.finish(RunStatus::Completed, &ReconcileStats::default());
    }
}
