// src/core/journal/replayer.rs

//! Stable-phase replay: one decode loop and one batching apply loop per
//! FLOW, joined by a bounded channel.
//!
//! The channel is the backpressure mechanism: when the target is slow the
//! apply loop lags, the channel fills, the decoder blocks, and TCP flow
//! control throttles the source. Nothing in between buffers unboundedly.

use crate::core::RiptideError;
use crate::core::cluster::{Router, TargetCommand};
use crate::core::journal::codec::{JournalDecoder, JournalEntry};
use crate::core::metrics::{self, Metrics};
use crate::core::replication::FlowSession;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// Reads journal records off one FLOW socket and forwards the replayable
/// ones into the per-FLOW channel. Returns cleanly on FIN; any decode error
/// is fatal for the session.
pub async fn decode_loop<R: AsyncRead + Unpin>(
    flow_index: usize,
    mut decoder: JournalDecoder<R>,
    tx: mpsc::Sender<JournalEntry>,
    metrics: Arc<Metrics>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RiptideError> {
    let mut counted_bytes = 0u64;
    loop {
        let entry = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Err(RiptideError::Cancelled),
            entry = decoder.next_entry() => entry?,
        };

        let total = decoder.bytes_read();
        metrics::add(&metrics.journal_bytes, total - counted_bytes);
        counted_bytes = total;

        match entry {
            JournalEntry::Ping => {
                trace!("FLOW {flow_index}: journal ping");
            }
            JournalEntry::Select { db_index } => {
                // Informational: every COMMAND record carries its own db index.
                trace!("FLOW {flow_index}: journal selected db {db_index}");
            }
            JournalEntry::Fin => {
                debug!("FLOW {flow_index}: journal FIN");
                return Ok(());
            }
            other => {
                if tx.send(other).await.is_err() {
                    // The apply loop is gone; its own error reaches the
                    // supervisor, ours would only be noise.
                    return Ok(());
                }
            }
        }
    }
}

/// The batching consumer for one FLOW's journal channel.
pub struct JournalApplier {
    pub flow: Arc<FlowSession>,
    pub router: Arc<Router>,
    pub metrics: Arc<Metrics>,
    /// Pipeline ceiling per flush. A transaction group may overflow it:
    /// entries sharing a tx id always ride one submission.
    pub batch_limit: usize,
}

/// Accumulates one flush worth of commands plus the LSN bookkeeping that
/// must only advance after they are dispatched.
#[derive(Default)]
struct PendingBatch {
    commands: Vec<TargetCommand>,
    max_lsn: u64,
    deferred_lsn: u64,
    last_tx_id: u64,
}

impl JournalApplier {
    pub async fn run(self, mut rx: mpsc::Receiver<JournalEntry>) -> Result<(), RiptideError> {
        let mut carry: Option<JournalEntry> = None;
        loop {
            let first = match carry.take() {
                Some(entry) => Some(entry),
                None => rx.recv().await,
            };
            let Some(first) = first else {
                // Channel closed: the decoder saw FIN or shut down.
                break;
            };

            let mut pending = PendingBatch::default();
            self.absorb(first, &mut pending);

            let mut closed = false;
            loop {
                if pending.commands.len() >= self.batch_limit {
                    if pending.last_tx_id == 0 {
                        break;
                    }
                    // The batch ends inside a transaction group; keep pulling
                    // until the group does, so it reaches one submission.
                    match rx.recv().await {
                        Some(entry) if continues_group(&entry, pending.last_tx_id) => {
                            self.absorb(entry, &mut pending);
                        }
                        Some(entry) => {
                            carry = Some(entry);
                            break;
                        }
                        None => {
                            closed = true;
                            break;
                        }
                    }
                } else {
                    match rx.try_recv() {
                        Ok(entry) => self.absorb(entry, &mut pending),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            closed = true;
                            break;
                        }
                    }
                }
            }

            self.flush(&pending).await?;

            // Dispatch happened; only now may the checkpointable position move.
            let lsn = pending.max_lsn.max(pending.deferred_lsn);
            if lsn > 0 {
                self.flow.advance_lsn(lsn);
            }

            if closed {
                break;
            }
        }
        Ok(())
    }

    fn absorb(&self, entry: JournalEntry, pending: &mut PendingBatch) {
        match entry {
            JournalEntry::Lsn { lsn } => {
                if pending.commands.is_empty() {
                    // Nothing undispatched ahead of it; safe to advance now.
                    self.flow.advance_lsn(lsn);
                } else {
                    pending.deferred_lsn = pending.deferred_lsn.max(lsn);
                }
                pending.last_tx_id = 0;
            }
            JournalEntry::Command {
                lsn, tx_id, args, ..
            } => {
                pending.commands.push(args);
                pending.max_lsn = pending.max_lsn.max(lsn);
                pending.last_tx_id = tx_id;
            }
            JournalEntry::Expired { lsn, key, .. } => {
                metrics::inc(&self.metrics.journal_expirations);
                pending
                    .commands
                    .push(vec![Bytes::from_static(b"DEL"), key]);
                pending.max_lsn = pending.max_lsn.max(lsn);
                pending.last_tx_id = 0;
            }
            // Select/Ping/Fin never reach the channel.
            other => {
                debug!(
                    "FLOW {}: ignoring non-replayable journal entry {other:?}",
                    self.flow.index
                );
            }
        }
    }

    async fn flush(&self, pending: &PendingBatch) -> Result<(), RiptideError> {
        if pending.commands.is_empty() {
            return Ok(());
        }
        let replies = self.router.dispatch_batch(&pending.commands).await?;
        for (cmd, reply) in pending.commands.iter().zip(&replies) {
            if let crate::core::protocol::RespFrame::Error(msg) = reply {
                // Semantic errors are counted and logged; replay goes on.
                metrics::inc(&self.metrics.semantic_errors);
                warn!(
                    "FLOW {}: target rejected {:?}: {msg}",
                    self.flow.index,
                    cmd.first().map(|c| String::from_utf8_lossy(c).to_string())
                );
            }
        }
        metrics::add(
            &self.metrics.journal_commands,
            pending.commands.len() as u64,
        );
        Ok(())
    }
}

fn continues_group(entry: &JournalEntry, tx_id: u64) -> bool {
    matches!(entry, JournalEntry::Command { tx_id: id, .. } if *id == tx_id)
}
