// src/core/snapshot/apply.rs

//! The snapshot sink: turns decoded entries into restore commands, applies
//! the conflict policy, and writes to the target in large node-grouped
//! batches.

use crate::config::ConflictPolicy;
use crate::core::RiptideError;
use crate::core::cluster::{Router, TargetCommand};
use crate::core::metrics::{self, Metrics};
use crate::core::protocol::RespFrame;
use crate::core::snapshot::entry::{RdbEntry, RdbValue};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One key's worth of restore work: the probe key plus the commands that
/// rebuild its value.
struct PendingKey {
    key: Bytes,
    commands: Vec<TargetCommand>,
}

/// The batching sink shared by all snapshot readers.
pub struct SnapshotApplier {
    pub router: Arc<Router>,
    pub metrics: Arc<Metrics>,
    pub policy: ConflictPolicy,
    /// Flush once this many commands have accumulated.
    pub batch_limit: usize,
    /// Collections larger than this are split across several commands.
    pub chunk_size: usize,
}

impl SnapshotApplier {
    /// Drains the shared entry channel until every reader has dropped its
    /// sender, flushing in node-grouped pipelines along the way.
    pub async fn run(self, mut rx: mpsc::Receiver<RdbEntry>) -> Result<(), RiptideError> {
        let mut pending: Vec<PendingKey> = Vec::new();
        let mut pending_commands = 0usize;
        let mut total_keys = 0u64;

        loop {
            let Some(entry) = rx.recv().await else {
                break;
            };
            pending_commands += self.stage(entry, &mut pending);

            // Drain whatever else is immediately available, up to the batch
            // ceiling, so small trickles still coalesce into one pipeline.
            while pending_commands < self.batch_limit {
                match rx.try_recv() {
                    Ok(entry) => pending_commands += self.stage(entry, &mut pending),
                    Err(_) => break,
                }
            }

            if pending_commands >= self.batch_limit || rx.is_empty() {
                total_keys += self.flush(&mut pending).await?;
                pending_commands = 0;
            }
        }

        total_keys += self.flush(&mut pending).await?;
        info!("Snapshot sink finished after writing {total_keys} key(s)");
        Ok(())
    }

    /// Converts one entry into commands and stages it. Returns how many
    /// commands it contributed.
    fn stage(&self, entry: RdbEntry, pending: &mut Vec<PendingKey>) -> usize {
        let key = entry.key.clone();
        let commands = restore_commands(&entry, self.chunk_size);
        if commands.is_empty() {
            return 0;
        }
        let count = commands.len();
        pending.push(PendingKey { key, commands });
        count
    }

    async fn flush(&self, pending: &mut Vec<PendingKey>) -> Result<u64, RiptideError> {
        if pending.is_empty() {
            return Ok(0);
        }
        let staged = std::mem::take(pending);

        // The conflict policy probes existing keys in one batched EXISTS
        // sweep before any write goes out.
        let survivors: Vec<PendingKey> = match self.policy {
            ConflictPolicy::Overwrite => staged,
            ConflictPolicy::Panic | ConflictPolicy::Skip => {
                let probes: Vec<TargetCommand> = staged
                    .iter()
                    .map(|p| vec![Bytes::from_static(b"EXISTS"), p.key.clone()])
                    .collect();
                let replies = self.router.dispatch_batch(&probes).await?;
                let mut keep = Vec::with_capacity(staged.len());
                for (pending_key, reply) in staged.into_iter().zip(replies) {
                    let exists = matches!(reply, RespFrame::Integer(n) if n > 0);
                    if !exists {
                        keep.push(pending_key);
                    } else if self.policy == ConflictPolicy::Panic {
                        return Err(RiptideError::Remote(format!(
                            "conflict policy is panic and key {:?} already exists on the target",
                            String::from_utf8_lossy(&pending_key.key)
                        )));
                    } else {
                        metrics::inc(&self.metrics.snapshot_keys_skipped);
                    }
                }
                keep
            }
        };

        let written = survivors.len() as u64;
        let commands: Vec<TargetCommand> = survivors
            .into_iter()
            .flat_map(|p| p.commands)
            .collect();
        if commands.is_empty() {
            return Ok(0);
        }

        let replies = self.router.dispatch_batch(&commands).await?;
        for (cmd, reply) in commands.iter().zip(&replies) {
            if let RespFrame::Error(msg) = reply {
                metrics::inc(&self.metrics.semantic_errors);
                warn!(
                    "Target rejected snapshot write {:?}: {msg}",
                    cmd.first().map(|c| String::from_utf8_lossy(c).to_string())
                );
            }
        }

        metrics::add(&self.metrics.snapshot_keys, written);
        Ok(written)
    }
}

/// Builds the command sequence that recreates `entry` on the target,
/// chunking large collections so no single command outgrows the target's
/// request limits.
pub fn restore_commands(entry: &RdbEntry, chunk_size: usize) -> Vec<TargetCommand> {
    let key = &entry.key;
    let mut commands: Vec<TargetCommand> = Vec::new();

    match &entry.value {
        RdbValue::String(value) => {
            commands.push(vec![Bytes::from_static(b"SET"), key.clone(), value.clone()]);
        }
        RdbValue::List(items) => {
            for chunk in items.chunks(chunk_size.max(1)) {
                if chunk.is_empty() {
                    continue;
                }
                let mut cmd = Vec::with_capacity(chunk.len() + 2);
                cmd.push(Bytes::from_static(b"RPUSH"));
                cmd.push(key.clone());
                cmd.extend(chunk.iter().cloned());
                commands.push(cmd);
            }
        }
        RdbValue::Set(members) => {
            for chunk in members.chunks(chunk_size.max(1)) {
                if chunk.is_empty() {
                    continue;
                }
                let mut cmd = Vec::with_capacity(chunk.len() + 2);
                cmd.push(Bytes::from_static(b"SADD"));
                cmd.push(key.clone());
                cmd.extend(chunk.iter().cloned());
                commands.push(cmd);
            }
        }
        RdbValue::Hash(pairs) => {
            for chunk in pairs.chunks(chunk_size.max(1)) {
                if chunk.is_empty() {
                    continue;
                }
                let mut cmd = Vec::with_capacity(chunk.len() * 2 + 2);
                cmd.push(Bytes::from_static(b"HSET"));
                cmd.push(key.clone());
                for (field, value) in chunk {
                    cmd.push(field.clone());
                    cmd.push(value.clone());
                }
                commands.push(cmd);
            }
        }
        RdbValue::ZSet(entries) => {
            for chunk in entries.chunks(chunk_size.max(1)) {
                if chunk.is_empty() {
                    continue;
                }
                let mut cmd = Vec::with_capacity(chunk.len() * 2 + 2);
                cmd.push(Bytes::from_static(b"ZADD"));
                cmd.push(key.clone());
                for zentry in chunk {
                    cmd.push(Bytes::from(format_score(zentry.score)));
                    cmd.push(zentry.member.clone());
                }
                commands.push(cmd);
            }
        }
        RdbValue::Stream(stream) => {
            for stream_entry in &stream.entries {
                let mut cmd = Vec::with_capacity(stream_entry.fields.len() * 2 + 3);
                cmd.push(Bytes::from_static(b"XADD"));
                cmd.push(key.clone());
                cmd.push(Bytes::from(format!(
                    "{}-{}",
                    stream_entry.id_ms, stream_entry.id_seq
                )));
                for (field, value) in &stream_entry.fields {
                    cmd.push(field.clone());
                    cmd.push(value.clone());
                }
                commands.push(cmd);
            }
        }
    }

    if commands.is_empty() {
        return commands;
    }

    if let Some(expire_at_ms) = entry.expire_at_ms {
        commands.push(vec![
            Bytes::from_static(b"PEXPIREAT"),
            key.clone(),
            Bytes::from(expire_at_ms.to_string()),
        ]);
    }

    commands
}

/// Renders a score the way the target parses it back, including the
/// infinities ZADD accepts.
fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}
