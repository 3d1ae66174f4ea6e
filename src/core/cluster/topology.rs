// src/core/cluster/topology.rs

//! The cluster topology cache: which node owns which hash slot.
//!
//! The table is read on every routed command and mutated only on discovery,
//! on a MOVED fixup, or on a full refresh, so it sits behind a read-write
//! lock. The `epoch` counter lets callers detect refreshes.

use crate::core::RiptideError;
use crate::core::cluster::slot::NUM_SLOTS;
use crate::core::protocol::RespFrame;
use parking_lot::RwLock;
use tracing::{debug, info};

/// An immutable view of the slot table at one point in time.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub slots: Vec<Option<String>>,
    pub epoch: u64,
    pub standalone: bool,
}

/// The shared slot→node table.
#[derive(Debug)]
pub struct Topology {
    inner: RwLock<TopologyInner>,
}

#[derive(Debug)]
struct TopologyInner {
    /// `slots[s]` is the `host:port` of the master owning slot `s`.
    slots: Vec<Option<String>>,
    /// Bumped on every full rebuild. Single-slot fixups do not bump it.
    epoch: u64,
    /// True when the target rejected the topology query; every slot then
    /// maps to the seed node.
    standalone: bool,
}

impl Topology {
    /// A topology where every slot maps to the single seed node.
    pub fn standalone(seed: &str) -> Self {
        Self {
            inner: RwLock::new(TopologyInner {
                slots: vec![Some(seed.to_string()); NUM_SLOTS],
                epoch: 1,
                standalone: true,
            }),
        }
    }

    /// A topology built from a parsed CLUSTER SLOTS reply.
    pub fn from_cluster_slots(reply: &RespFrame) -> Result<Self, RiptideError> {
        let mut slots: Vec<Option<String>> = vec![None; NUM_SLOTS];
        fill_from_cluster_slots(&mut slots, reply)?;
        Ok(Self {
            inner: RwLock::new(TopologyInner {
                slots,
                epoch: 1,
                standalone: false,
            }),
        })
    }

    pub fn is_standalone(&self) -> bool {
        self.inner.read().standalone
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    /// The address owning `slot`, if the table knows one.
    pub fn node_for_slot(&self, slot: u16) -> Option<String> {
        self.inner.read().slots[slot as usize].clone()
    }

    /// Every distinct master address currently present in the table.
    pub fn node_addrs(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut addrs: Vec<String> = inner.slots.iter().flatten().cloned().collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    /// Applies a single-slot ownership change learned from a MOVED reply.
    pub fn apply_moved(&self, slot: u16, addr: &str) {
        let mut inner = self.inner.write();
        debug!("Slot {slot} moved to {addr}");
        inner.slots[slot as usize] = Some(addr.to_string());
    }

    /// Replaces the whole table from a fresh CLUSTER SLOTS reply and bumps the epoch.
    pub fn refresh(&self, reply: &RespFrame) -> Result<u64, RiptideError> {
        let mut slots: Vec<Option<String>> = vec![None; NUM_SLOTS];
        fill_from_cluster_slots(&mut slots, reply)?;
        let mut inner = self.inner.write();
        inner.slots = slots;
        inner.epoch += 1;
        info!("Cluster topology refreshed (epoch {})", inner.epoch);
        Ok(inner.epoch)
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let inner = self.inner.read();
        TopologySnapshot {
            slots: inner.slots.clone(),
            epoch: inner.epoch,
            standalone: inner.standalone,
        }
    }
}

/// Parses a CLUSTER SLOTS reply into the slot table. Each element is
/// `[start, end, [master-ip, master-port, ...], replica...]`; replicas are
/// ignored since the engine only ever writes.
fn fill_from_cluster_slots(
    slots: &mut [Option<String>],
    reply: &RespFrame,
) -> Result<(), RiptideError> {
    let RespFrame::Array(ranges) = reply else {
        return Err(RiptideError::Protocol(format!(
            "Expected array reply to CLUSTER SLOTS, got {reply:?}"
        )));
    };

    for range in ranges {
        let RespFrame::Array(parts) = range else {
            return Err(RiptideError::Protocol(
                "Malformed CLUSTER SLOTS range entry".into(),
            ));
        };
        if parts.len() < 3 {
            return Err(RiptideError::Protocol(
                "CLUSTER SLOTS range entry too short".into(),
            ));
        }
        let (RespFrame::Integer(start), RespFrame::Integer(end)) = (&parts[0], &parts[1]) else {
            return Err(RiptideError::Protocol(
                "CLUSTER SLOTS range bounds are not integers".into(),
            ));
        };
        if *start < 0 || *end < 0 || *end >= NUM_SLOTS as i64 || start > end {
            return Err(RiptideError::Protocol(format!(
                "CLUSTER SLOTS range {start}-{end} out of bounds"
            )));
        }
        let addr = parse_node_entry(&parts[2])?;
        for slot in *start..=*end {
            slots[slot as usize] = Some(addr.clone());
        }
    }
    Ok(())
}

/// Parses the `[ip, port, ...]` node element of a CLUSTER SLOTS range.
fn parse_node_entry(frame: &RespFrame) -> Result<String, RiptideError> {
    let RespFrame::Array(node) = frame else {
        return Err(RiptideError::Protocol(
            "CLUSTER SLOTS node entry is not an array".into(),
        ));
    };
    if node.len() < 2 {
        return Err(RiptideError::Protocol(
            "CLUSTER SLOTS node entry too short".into(),
        ));
    }
    let host = match &node[0] {
        RespFrame::BulkString(b) => String::from_utf8_lossy(b).to_string(),
        RespFrame::SimpleString(s) => s.clone(),
        other => {
            return Err(RiptideError::Protocol(format!(
                "CLUSTER SLOTS node host has unexpected shape: {other:?}"
            )));
        }
    };
    let RespFrame::Integer(port) = &node[1] else {
        return Err(RiptideError::Protocol(
            "CLUSTER SLOTS node port is not an integer".into(),
        ));
    };
    Ok(format!("{host}:{port}"))
}
