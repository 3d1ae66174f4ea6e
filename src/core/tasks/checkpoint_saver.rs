// src/core/tasks/checkpoint_saver.rs

//! The checkpoint keeper: a timer task that periodically persists every
//! FLOW's position, plus a final save when shutdown is signalled.

use crate::core::checkpoint::Checkpoint;
use crate::core::events::{EventBus, ProgressEvent};
use crate::core::metrics::{self, Metrics};
use crate::core::replication::FlowSession;
use crate::core::source::MasterInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

pub struct CheckpointSaverTask {
    pub path: String,
    pub interval: Duration,
    pub master: MasterInfo,
    pub flows: Vec<Arc<FlowSession>>,
    pub metrics: Arc<Metrics>,
    pub events: EventBus,
}

impl CheckpointSaverTask {
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh run does not
        // checkpoint all-zero positions before anything happened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.save_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Checkpoint keeper shutting down; writing final checkpoint");
                    self.save_once().await;
                    return;
                }
            }
        }
    }

    async fn save_once(&self) {
        let checkpoint = Checkpoint::capture(&self.master, &self.flows);
        match checkpoint.save_atomic(&self.path).await {
            Ok(()) => {
                metrics::inc(&self.metrics.checkpoints_saved);
                self.events.publish(ProgressEvent::CheckpointSaved {
                    path: self.path.clone(),
                });
                debug!(
                    "Checkpoint saved to {} with LSNs {:?}",
                    self.path, checkpoint.flow_lsns
                );
            }
            Err(e) => {
                // A failed periodic save costs resumability, not correctness.
                error!("Failed to save checkpoint to {}: {e}", self.path);
            }
        }
    }
}
