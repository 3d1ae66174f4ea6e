// src/core/checkpoint.rs

//! The resumability checkpoint: one JSON document holding every FLOW's last
//! dispatched LSN, written atomically so the file on disk is either absent
//! or fully valid.

use crate::core::RiptideError;
use crate::core::replication::FlowSession;
use crate::core::source::MasterInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Bumped when the document layout changes incompatibly.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub version: u32,
    pub replication_id: String,
    pub sync_id: String,
    pub num_flows: usize,
    pub flow_lsns: Vec<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshots the current position of every FLOW.
    pub fn capture(master: &MasterInfo, flows: &[Arc<FlowSession>]) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            replication_id: master.replication_id.clone(),
            sync_id: master.sync_id.clone(),
            num_flows: flows.len(),
            flow_lsns: flows.iter().map(|f| f.current_lsn()).collect(),
            updated_at: Utc::now(),
        }
    }

    /// True when this checkpoint belongs to the source the handshake just
    /// talked to. A mismatched replication id means the source was
    /// reinitialized and the saved positions are meaningless.
    pub fn matches(&self, master: &MasterInfo) -> bool {
        self.version == CHECKPOINT_VERSION
            && self.replication_id == master.replication_id
            && self.num_flows == master.num_flows
            && self.flow_lsns.len() == master.num_flows
    }

    /// Writes the document atomically: temp file, fsync, rename.
    pub async fn save_atomic(&self, path: &str) -> Result<(), RiptideError> {
        let payload = serde_json::to_vec_pretty(self)?;
        let tmp_path = format!("{path}.tmp");

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| RiptideError::CheckpointError(format!("create {tmp_path}: {e}")))?;
        file.write_all(&payload)
            .await
            .map_err(|e| RiptideError::CheckpointError(format!("write {tmp_path}: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| RiptideError::CheckpointError(format!("fsync {tmp_path}: {e}")))?;
        drop(file);

        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| RiptideError::CheckpointError(format!("rename onto {path}: {e}")))?;
        Ok(())
    }

    /// Loads a checkpoint if one exists. A missing file is a normal first
    /// run; an unreadable one is ignored with a warning, since it is only a
    /// resume hint and a full sync is always a safe answer.
    pub async fn load(path: &str) -> Result<Option<Checkpoint>, RiptideError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RiptideError::CheckpointError(format!("read {path}: {e}")));
            }
        };

        match serde_json::from_slice::<Checkpoint>(&raw) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint from {path} (replication id {}, {} flow(s))",
                    checkpoint.replication_id, checkpoint.num_flows
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                warn!("Ignoring unparseable checkpoint at {path}: {e}");
                Ok(None)
            }
        }
    }
}
