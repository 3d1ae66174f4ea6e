// src/core/snapshot/reader.rs

//! The per-FLOW snapshot worker: decode entries, drop the already-expired,
//! feed the shared channel, then park on the barrier once the EOF token has
//! been verified.

use crate::core::RiptideError;
use crate::core::events::{EventBus, ProgressEvent};
use crate::core::metrics::{self, Metrics};
use crate::core::replication::{FlowSession, FlowState, SyncBarrier};
use crate::core::snapshot::entry::RdbEntry;
use crate::core::snapshot::rdb::{RdbDecoder, RdbItem};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Runs the snapshot phase of one FLOW and returns the decoder once the
/// barrier has released, so the journal phase can continue on the same
/// socket. Any error before the barrier releases is fatal for the session.
pub async fn run_snapshot_phase<R: AsyncRead + Unpin>(
    flow: Arc<FlowSession>,
    mut decoder: RdbDecoder<R>,
    entry_tx: mpsc::Sender<RdbEntry>,
    barrier: Arc<SyncBarrier>,
    metrics: Arc<Metrics>,
    events: EventBus,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<RdbDecoder<R>, RiptideError> {
    flow.advance_state(FlowState::Snapshot)?;
    let mut counted_bytes = 0u64;
    let mut keys = 0u64;

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Err(RiptideError::Cancelled),
            item = decoder.next_item() => item?,
        };

        let total = decoder.bytes_read();
        metrics::add(&metrics.snapshot_bytes, total - counted_bytes);
        counted_bytes = total;

        match item {
            RdbItem::Entry(entry) => {
                if is_already_expired(&entry) {
                    metrics::inc(&metrics.expired_dropped);
                    continue;
                }
                keys += 1;
                if entry_tx.send(entry).await.is_err() {
                    // The sink failed; its error is what the supervisor will
                    // report.
                    return Err(RiptideError::Cancelled);
                }
            }
            RdbItem::Eof => break,
        }
    }

    debug!(
        "FLOW {}: snapshot complete after {keys} key(s), EOF token verified",
        flow.index
    );
    flow.advance_state(FlowState::AwaitingBarrier)?;
    events.publish(ProgressEvent::FlowSnapshotDone { flow: flow.index });

    let arrived = barrier.arrive();
    info!(
        "FLOW {}: awaiting snapshot barrier ({arrived} arrived)",
        flow.index
    );

    // The connection stays open while we wait; journal bytes the source
    // already streams pile up in the kernel receive buffer.
    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => return Err(RiptideError::Cancelled),
        _ = barrier.released() => {}
    }

    flow.advance_state(FlowState::Stable)?;
    Ok(decoder)
}

/// A key whose absolute expiry is already in the past is silently dropped
/// before emission.
fn is_already_expired(entry: &RdbEntry) -> bool {
    let Some(expire_at_ms) = entry.expire_at_ms else {
        return false;
    };
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    expire_at_ms <= now_ms
}
