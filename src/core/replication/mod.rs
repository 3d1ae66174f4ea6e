// src/core/replication/mod.rs

//! Shared replication state: per-FLOW sessions, their state machine, and the
//! one-shot snapshot barrier.

pub mod supervisor;

use crate::core::RiptideError;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use strum_macros::Display;
use tokio::sync::watch;

/// The lifecycle of one FLOW. Transitions are forward-only:
///
/// ```text
/// Handshaking ─DFLY FLOW ok→ Snapshot ─EOF token→ AwaitingBarrier
///     ─barrier release→ Stable ─FIN or error→ Closed
/// ```
///
/// A partial resume jumps from Handshaking straight to Stable, which the
/// ordering below permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum FlowState {
    Handshaking,
    Snapshot,
    AwaitingBarrier,
    Stable,
    Closed,
}

/// The per-shard replication session. Owned collectively by the worker tasks
/// of one FLOW; the LSN is written only by that FLOW's journal worker and
/// read by the checkpoint keeper.
#[derive(Debug)]
pub struct FlowSession {
    pub index: usize,
    pub eof_token: Bytes,
    lsn: AtomicU64,
    state_tx: watch::Sender<FlowState>,
}

impl FlowSession {
    pub fn new(index: usize, eof_token: Bytes, initial_lsn: u64) -> Self {
        let (state_tx, _) = watch::channel(FlowState::Handshaking);
        Self {
            index,
            eof_token,
            lsn: AtomicU64::new(initial_lsn),
            state_tx,
        }
    }

    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::Acquire)
    }

    /// Records a newly dispatched position. LSNs observed on a FLOW are
    /// non-decreasing, so this is a monotonic max.
    pub fn advance_lsn(&self, lsn: u64) {
        self.lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    pub fn state(&self) -> FlowState {
        *self.state_tx.borrow()
    }

    /// Moves the session forward. Re-asserting the current state is a no-op;
    /// moving backwards is an invariant violation.
    pub fn advance_state(&self, next: FlowState) -> Result<(), RiptideError> {
        let current = self.state();
        if next < current {
            return Err(RiptideError::Internal(format!(
                "flow {} may not go back from {current} to {next}",
                self.index
            )));
        }
        if next != current {
            self.state_tx.send_replace(next);
        }
        Ok(())
    }

    /// A receiver that observes every state change, used by tests and the
    /// status sink.
    pub fn watch_state(&self) -> watch::Receiver<FlowState> {
        self.state_tx.subscribe()
    }
}

/// The one-shot snapshot barrier.
///
/// Every FLOW worker calls `arrive` after verifying its EOF token, then
/// parks on `released`. The Nth arrival releases every waiter at once, so no
/// FLOW starts journal replay while another shard is still snapshotting.
/// Released exactly once; late waiters observe it immediately.
#[derive(Debug)]
pub struct SyncBarrier {
    total: usize,
    arrived: AtomicUsize,
    released_tx: watch::Sender<bool>,
}

impl SyncBarrier {
    pub fn new(total: usize) -> Self {
        let (released_tx, _) = watch::channel(total == 0);
        Self {
            total,
            arrived: AtomicUsize::new(0),
            released_tx,
        }
    }

    /// Registers one arrival and returns the running count. The last arriver
    /// releases the barrier.
    pub fn arrive(&self) -> usize {
        let count = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if count == self.total {
            self.released_tx.send_replace(true);
        }
        count
    }

    pub fn arrived(&self) -> usize {
        self.arrived.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        *self.released_tx.borrow()
    }

    /// Waits until every FLOW has arrived.
    pub async fn released(&self) {
        let mut rx = self.released_tx.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed
        // channel while we hold &self.
        let _ = rx.wait_for(|released| *released).await;
    }
}
