// src/core/cluster/router.rs

//! Routes commands to the correct target node and recovers from cluster
//! redirections.
//!
//! The batching path is the performance-critical piece: callers hand over a
//! whole batch and the router groups it by destination *node* (not slot), so
//! thousands of keys landing in one node's slot range ride a single pipeline.

use crate::config::TargetConfig;
use crate::core::RiptideError;
use crate::core::cluster::node::NodeConnection;
use crate::core::cluster::slot::get_slot;
use crate::core::cluster::topology::Topology;
use crate::core::metrics::{self, Metrics};
use crate::core::protocol::RespFrame;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many MOVED/ASK hops a single command may take before the router
/// gives up on it.
const REDIRECT_BUDGET: u32 = 5;

/// After this many redirects within one dispatch, the slot table is assumed
/// stale as a whole and rebuilt from CLUSTER SLOTS.
const REFRESH_AFTER_REDIRECTS: u32 = 2;

/// A command destined for the target, as a ready-to-send argument vector.
/// The first argument is the command name; the second is the routing key.
pub type TargetCommand = Vec<Bytes>;

/// Returns the routing key of a command. Every command the engine emits
/// (SET/HSET/RPUSH/SADD/ZADD/XADD/DEL/PEXPIREAT/EXISTS/...) keys on its
/// second argument.
pub fn routing_key(cmd: &TargetCommand) -> Option<&Bytes> {
    cmd.get(1)
}

pub struct Router {
    topology: Topology,
    nodes: RwLock<HashMap<String, Arc<NodeConnection>>>,
    target: TargetConfig,
    metrics: Arc<Metrics>,
}

impl Router {
    /// Connects to the seed node and discovers the topology.
    ///
    /// A cluster target answers CLUSTER SLOTS with the slot map; a standalone
    /// target rejects it ("cluster support disabled"), which drops the router
    /// into standalone mode with every slot mapped to the seed.
    pub async fn connect(target: TargetConfig, metrics: Arc<Metrics>) -> Result<Self, RiptideError> {
        let seed = Arc::new(NodeConnection::new(
            target.addr.clone(),
            target.password.clone(),
            target.connect_timeout,
            target.response_timeout,
            target.node_reconnect_attempts,
        ));

        let topology = match target.mode {
            crate::config::TargetMode::Standalone => {
                info!("Target configured as standalone; skipping topology discovery");
                Topology::standalone(&target.addr)
            }
            _ => {
                let reply = seed
                    .request(&[Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")])
                    .await?;
                match &reply {
                    RespFrame::Error(e) if is_cluster_disabled_error(e) => {
                        if target.mode == crate::config::TargetMode::Cluster {
                            return Err(RiptideError::Connect(format!(
                                "target configured as cluster but reports: {e}"
                            )));
                        }
                        info!("Target has cluster support disabled; running in standalone mode");
                        Topology::standalone(&target.addr)
                    }
                    RespFrame::Error(e) => {
                        return Err(RiptideError::Connect(format!(
                            "topology discovery failed: {e}"
                        )));
                    }
                    _ => {
                        let topo = Topology::from_cluster_slots(&reply)?;
                        info!(
                            "Discovered cluster topology with {} master node(s)",
                            topo.node_addrs().len()
                        );
                        topo
                    }
                }
            }
        };

        let mut nodes = HashMap::new();
        nodes.insert(target.addr.clone(), seed);

        let router = Self {
            topology,
            nodes: RwLock::new(nodes),
            target,
            metrics,
        };

        // Open connections to every discovered master up front so the first
        // snapshot batch does not pay N dial latencies.
        for addr in router.topology.node_addrs() {
            router.node(&addr);
        }

        Ok(router)
    }

    pub fn is_cluster(&self) -> bool {
        !self.topology.is_standalone()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The address currently responsible for `key`.
    pub fn addr_for_key(&self, key: &Bytes) -> Result<String, RiptideError> {
        let slot = get_slot(key);
        self.topology.node_for_slot(slot).ok_or_else(|| {
            RiptideError::Internal(format!("no node known for slot {slot}"))
        })
    }

    /// Returns the connection for `addr`, opening it lazily if absent.
    fn node(&self, addr: &str) -> Arc<NodeConnection> {
        if let Some(node) = self.nodes.read().get(addr) {
            return node.clone();
        }
        let mut nodes = self.nodes.write();
        nodes
            .entry(addr.to_string())
            .or_insert_with(|| {
                Arc::new(NodeConnection::new(
                    addr.to_string(),
                    self.target.password.clone(),
                    self.target.connect_timeout,
                    self.target.response_timeout,
                    self.target.node_reconnect_attempts,
                ))
            })
            .clone()
    }

    /// Sends one command, following redirects.
    ///
    /// The returned frame may still be an error reply (WRONGTYPE and other
    /// semantic errors are the caller's business); only transport failures
    /// and exhausted redirects surface as `Err`.
    pub async fn dispatch(&self, cmd: &TargetCommand) -> Result<RespFrame, RiptideError> {
        let key = routing_key(cmd).ok_or_else(|| {
            RiptideError::Internal("cannot route a command without a key".into())
        })?;
        let slot = get_slot(key);
        let mut addr = self
            .topology
            .node_for_slot(slot)
            .ok_or_else(|| RiptideError::Internal(format!("no node known for slot {slot}")))?;

        let mut asking = false;
        let mut redirects = 0u32;
        loop {
            let node = self.node(&addr);
            let reply = if asking {
                // ASK redirects require an ASKING prefix on the target node
                // and must not update the slot table.
                let asking_cmd: TargetCommand = vec![Bytes::from_static(b"ASKING")];
                let mut replies = node.pipeline(&[asking_cmd, cmd.clone()]).await?;
                replies
                    .pop()
                    .ok_or_else(|| RiptideError::Internal("ASKING pipeline lost a reply".into()))?
            } else {
                node.request(cmd).await?
            };

            match parse_redirect(&reply) {
                Some(RiptideError::Moved { slot: s, addr: new_addr }) => {
                    redirects += 1;
                    metrics::inc(&self.metrics.redirects_moved);
                    if redirects > REDIRECT_BUDGET {
                        return Err(RiptideError::RedirectExhausted {
                            slot: s,
                            attempts: redirects,
                        });
                    }
                    self.topology.apply_moved(s, &new_addr);
                    if redirects >= REFRESH_AFTER_REDIRECTS {
                        self.refresh_topology().await;
                    }
                    addr = new_addr;
                    asking = false;
                }
                Some(RiptideError::Ask { addr: new_addr, .. }) => {
                    redirects += 1;
                    metrics::inc(&self.metrics.redirects_ask);
                    if redirects > REDIRECT_BUDGET {
                        return Err(RiptideError::RedirectExhausted {
                            slot,
                            attempts: redirects,
                        });
                    }
                    addr = new_addr;
                    asking = true;
                }
                _ => return Ok(reply),
            }
        }
    }

    /// Sends a batch of commands, grouped by destination node and pipelined
    /// per node. Replies come back in submission order.
    ///
    /// Commands that draw a redirect inside a pipeline are replayed
    /// individually through `dispatch`, which also fixes up the slot table.
    pub async fn dispatch_batch(
        &self,
        commands: &[TargetCommand],
    ) -> Result<Vec<RespFrame>, RiptideError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        // Group by destination node, keeping the original index of every
        // command so replies can be reassembled in submission order.
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, cmd) in commands.iter().enumerate() {
            let key = routing_key(cmd).ok_or_else(|| {
                RiptideError::Internal("cannot route a command without a key".into())
            })?;
            let addr = self.addr_for_key(key)?;
            groups.entry(addr).or_default().push(idx);
        }

        let mut replies: Vec<Option<RespFrame>> = vec![None; commands.len()];

        // Pipelines to distinct nodes are independent; run them concurrently.
        let node_futures = groups.into_iter().map(|(addr, indices)| {
            let node = self.node(&addr);
            async move {
                let batch: Vec<TargetCommand> =
                    indices.iter().map(|&i| commands[i].clone()).collect();
                let node_replies = node.pipeline(&batch).await?;
                Ok::<_, RiptideError>((indices, node_replies))
            }
        });

        for result in futures::future::join_all(node_futures).await {
            let (indices, node_replies) = result?;
            if node_replies.len() != indices.len() {
                return Err(RiptideError::Protocol(format!(
                    "pipeline reply count mismatch: sent {}, got {}",
                    indices.len(),
                    node_replies.len()
                )));
            }
            for (i, reply) in indices.into_iter().zip(node_replies) {
                replies[i] = Some(reply);
            }
        }

        // Second pass: any redirected command is replayed individually.
        for (idx, slot_reply) in replies.iter_mut().enumerate() {
            let needs_retry = slot_reply
                .as_ref()
                .is_some_and(|r| parse_redirect(r).is_some());
            if needs_retry {
                debug!("Replaying redirected command at batch index {idx}");
                *slot_reply = Some(self.dispatch(&commands[idx]).await?);
            }
        }

        Ok(replies
            .into_iter()
            .map(|r| r.expect("every batch slot is filled"))
            .collect())
    }

    /// Rebuilds the slot table from CLUSTER SLOTS via any reachable node.
    async fn refresh_topology(&self) {
        if self.topology.is_standalone() {
            return;
        }
        let addrs = self.topology.node_addrs();
        for addr in addrs {
            let node = self.node(&addr);
            match node
                .request(&[Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")])
                .await
            {
                Ok(reply @ RespFrame::Array(_)) => match self.topology.refresh(&reply) {
                    Ok(_) => {
                        metrics::inc(&self.metrics.topology_refreshes);
                        return;
                    }
                    Err(e) => warn!("Ignoring malformed CLUSTER SLOTS from {addr}: {e}"),
                },
                Ok(other) => warn!("Unexpected CLUSTER SLOTS reply from {addr}: {other:?}"),
                Err(e) => warn!("Topology refresh via {addr} failed: {e}"),
            }
        }
        warn!("Topology refresh failed on every known node; keeping the stale table");
    }

    /// Closes every node connection.
    pub async fn close(&self) {
        let nodes: Vec<Arc<NodeConnection>> = self.nodes.read().values().cloned().collect();
        for node in nodes {
            node.close().await;
        }
    }
}

/// Recognizes MOVED/ASK error replies and parses them into redirect errors.
pub fn parse_redirect(frame: &RespFrame) -> Option<RiptideError> {
    let RespFrame::Error(msg) = frame else {
        return None;
    };
    let mut parts = msg.split_whitespace();
    let kind = parts.next()?;
    if !kind.eq_ignore_ascii_case("MOVED") && !kind.eq_ignore_ascii_case("ASK") {
        return None;
    }
    let slot: u16 = parts.next()?.parse().ok()?;
    let addr = parts.next()?.to_string();
    if kind.eq_ignore_ascii_case("MOVED") {
        Some(RiptideError::Moved { slot, addr })
    } else {
        Some(RiptideError::Ask { slot, addr })
    }
}

/// The error Redis standalone returns when asked for cluster topology.
fn is_cluster_disabled_error(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("cluster support disabled") || lower.contains("unknown command")
}
