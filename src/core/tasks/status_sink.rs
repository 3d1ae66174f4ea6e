// src/core/tasks/status_sink.rs

//! The status-file sink: consumes the progress event bus and maintains a
//! small JSON status document plus an append-only event log. The CLI
//! front-end and the dashboard read these files; the engine never depends
//! on them.

use crate::config::StatusConfig;
use crate::core::events::{EventBus, ProgressEvent, Stage};
use crate::core::metrics::{Metrics, MetricsSnapshot};
use crate::core::replication::FlowSession;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::warn;

/// The document rewritten to `status_path`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    pub pipeline: Stage,
    pub message: String,
    pub replication_id: Option<String>,
    pub num_flows: Option<usize>,
    pub flow_lsns: Vec<u64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
}

/// One line of the append-only event log.
#[derive(Debug, Serialize)]
struct EventLogLine<'a> {
    at: DateTime<Utc>,
    event: &'a str,
    detail: String,
}

pub struct StatusSinkTask {
    pub config: StatusConfig,
    pub metrics: Arc<Metrics>,
    /// Populated by the supervisor once the handshake has produced the
    /// FLOW sessions.
    pub flows: Arc<RwLock<Vec<Arc<FlowSession>>>>,
    pub events: EventBus,
}

impl StatusSinkTask {
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut event_rx = self.events.subscribe();
        let mut ticker = tokio::time::interval(self.config.refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut doc = StatusDocument {
            pipeline: Stage::Starting,
            message: "starting".to_string(),
            replication_id: None,
            num_flows: None,
            flow_lsns: Vec::new(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            metrics: self.metrics.snapshot(),
        };
        self.write_status(&mut doc).await;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Ok(event) => {
                            self.log_event(&event).await;
                            self.apply_event(&mut doc, event);
                            self.write_status(&mut doc).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Status sink lagged; {missed} event(s) dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {
                    self.write_status(&mut doc).await;
                }
                _ = shutdown_rx.recv() => {
                    // Drain anything already on the bus so the final
                    // document reflects the last transitions.
                    while let Ok(event) = event_rx.try_recv() {
                        self.log_event(&event).await;
                        self.apply_event(&mut doc, event);
                    }
                    self.write_status(&mut doc).await;
                    break;
                }
            }
        }
    }

    fn apply_event(&self, doc: &mut StatusDocument, event: ProgressEvent) {
        match event {
            ProgressEvent::StageChanged { stage, message } => {
                doc.pipeline = stage;
                doc.message = message;
            }
            ProgressEvent::HandshakeComplete {
                replication_id,
                num_flows,
            } => {
                doc.replication_id = Some(replication_id);
                doc.num_flows = Some(num_flows);
            }
            ProgressEvent::FlowSnapshotDone { flow } => {
                doc.message = format!("flow {flow} finished its snapshot");
            }
            ProgressEvent::BarrierReleased => {
                doc.message = "snapshot barrier released".to_string();
            }
            ProgressEvent::StableStarted => {
                doc.message = "stable replication running".to_string();
            }
            ProgressEvent::FlowFinished { flow } => {
                doc.message = format!("flow {flow} finished its journal");
            }
            ProgressEvent::CheckpointSaved { .. } => {}
            ProgressEvent::ReplayError { flow, message } => {
                doc.message = format!("flow {flow}: {message}");
            }
            ProgressEvent::Fatal { message } => {
                doc.pipeline = Stage::Failed;
                doc.message = message;
            }
        }
    }

    /// Atomically rewrites the status document, refreshing the live fields.
    async fn write_status(&self, doc: &mut StatusDocument) {
        let Some(path) = &self.config.status_path else {
            return;
        };
        doc.updated_at = Utc::now();
        doc.metrics = self.metrics.snapshot();
        doc.flow_lsns = self.flows.read().iter().map(|f| f.current_lsn()).collect();

        let payload = match serde_json::to_vec_pretty(&doc) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize status document: {e}");
                return;
            }
        };
        let tmp_path = format!("{path}.tmp");
        let result = async {
            tokio::fs::write(&tmp_path, &payload).await?;
            tokio::fs::rename(&tmp_path, path).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to write status document to {path}: {e}");
        }
    }

    /// Appends one JSON line per notable transition.
    async fn log_event(&self, event: &ProgressEvent) {
        let Some(path) = &self.config.event_log_path else {
            return;
        };
        let line = EventLogLine {
            at: Utc::now(),
            event: event_name(event),
            detail: format!("{event:?}"),
        };
        let mut payload = match serde_json::to_vec(&line) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        payload.push(b'\n');

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(&payload).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to append to event log {path}: {e}");
        }
    }
}

fn event_name(event: &ProgressEvent) -> &'static str {
    match event {
        ProgressEvent::StageChanged { .. } => "stage-changed",
        ProgressEvent::HandshakeComplete { .. } => "handshake-complete",
        ProgressEvent::FlowSnapshotDone { .. } => "flow-snapshot-done",
        ProgressEvent::BarrierReleased => "barrier-released",
        ProgressEvent::StableStarted => "stable-started",
        ProgressEvent::FlowFinished { .. } => "flow-finished",
        ProgressEvent::CheckpointSaved { .. } => "checkpoint-saved",
        ProgressEvent::ReplayError { .. } => "replay-error",
        ProgressEvent::Fatal { .. } => "fatal",
    }
}
