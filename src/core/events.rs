// src/core/events.rs

//! The progress event bus. The engine publishes notable transitions here;
//! the status sink (and any other subscriber, e.g. tests) consumes them.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the event bus. Events are small and the sink drains quickly;
/// a lagging subscriber loses old events rather than blocking the engine.
const EVENT_BUS_CAPACITY: usize = 1024;

/// The coarse stage the whole pipeline is in, as persisted to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Starting,
    Handshake,
    Snapshot,
    Stable,
    Completed,
    Failed,
}

/// A notable transition in the life of a replication run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StageChanged { stage: Stage, message: String },
    HandshakeComplete { replication_id: String, num_flows: usize },
    FlowSnapshotDone { flow: usize },
    BarrierReleased,
    StableStarted,
    FlowFinished { flow: usize },
    CheckpointSaved { path: String },
    ReplayError { flow: usize, message: String },
    Fatal { message: String },
}

/// A cheaply cloneable handle for publishing progress events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. A send error only means nobody is subscribed,
    /// which is fine: the engine runs with or without a sink.
    pub fn publish(&self, event: ProgressEvent) {
        debug!("Progress event: {event:?}");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
