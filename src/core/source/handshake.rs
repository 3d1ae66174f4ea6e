// src/core/source/handshake.rs

//! The replica handshake against a Dragonfly source.
//!
//! A sequential state machine over the control connection, followed by one
//! `DFLY FLOW` exchange per shard on a dedicated connection. The source
//! starts streaming RDB on every FLOW socket once `DFLY SYNC` is sent, and
//! switches to the journal once `DFLY STARTSTABLE` is sent; both of those are
//! issued by the supervisor at the right moments, via the helpers here.

use crate::config::SourceConfig;
use crate::core::RiptideError;
use crate::core::checkpoint::Checkpoint;
use crate::core::protocol::RespFrame;
use crate::core::source::connection::{SocketTuning, SourceConnection};
use bytes::Bytes;
use tracing::{debug, info};

/// The capability token announced to the source. A genuine Dragonfly answers
/// it with the replication map; legacy Redis answers with a short array and
/// is rejected.
const CAPA_TOKEN: &str = "dragonfly";

/// What the source told us about itself during the capability exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    pub replication_id: String,
    pub sync_id: String,
    pub protocol_version: u64,
    pub num_flows: usize,
}

/// Whether a FLOW will receive a snapshot or resume from a journal position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Full,
    Partial,
}

/// The outcome of one `DFLY FLOW` exchange. The connection stays open and
/// carries that shard's snapshot and journal from here on.
#[derive(Debug)]
pub struct FlowHandshake {
    pub index: usize,
    pub sync_type: SyncType,
    pub eof_token: Bytes,
    pub connection: SourceConnection,
}

/// Everything the handshake produced: the master identity, the control
/// connection (kept open for SYNC/STARTSTABLE), and one open FLOW per shard.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub master: MasterInfo,
    pub control: SourceConnection,
    pub flows: Vec<FlowHandshake>,
    /// True when at least one FLOW answered FULL, which demotes the whole
    /// run to a full sync.
    pub full_sync: bool,
}

/// Runs the complete handshake. `resume` carries a previously saved
/// checkpoint; when it matches the source's identity its per-flow positions
/// are offered on every FLOW, and when the source honors all of them the run
/// resumes partially. Otherwise the run is full.
pub async fn perform(
    cfg: &SourceConfig,
    tuning: SocketTuning,
    resume: Option<&Checkpoint>,
) -> Result<HandshakeOutcome, RiptideError> {
    let mut control = connect(cfg, tuning).await?;

    // Step 1: PING. Proves liveness and that AUTH (if any) succeeded.
    let reply = control.request(&[Bytes::from_static(b"PING")]).await?;
    expect_simple(&reply, "PONG")?;
    debug!("Handshake: PING acknowledged");

    // Steps 2 and 3: announce where this replica can be reached.
    let local = control.local_addr()?;
    let announce_port = cfg.announce_port.unwrap_or_else(|| local.port());
    let announce_ip = cfg
        .announce_ip
        .clone()
        .unwrap_or_else(|| local.ip().to_string());

    let reply = control
        .request(&[
            Bytes::from_static(b"REPLCONF"),
            Bytes::from_static(b"listening-port"),
            Bytes::from(announce_port.to_string()),
        ])
        .await?;
    expect_simple(&reply, "OK")?;

    let reply = control
        .request(&[
            Bytes::from_static(b"REPLCONF"),
            Bytes::from_static(b"ip-address"),
            Bytes::from(announce_ip.clone()),
        ])
        .await?;
    expect_simple(&reply, "OK")?;
    debug!("Handshake: announced {announce_ip}:{announce_port}");

    // Step 4: declare the Dragonfly capability and parse the master identity.
    let reply = control
        .request(&[
            Bytes::from_static(b"REPLCONF"),
            Bytes::from_static(b"capa"),
            Bytes::from_static(CAPA_TOKEN.as_bytes()),
        ])
        .await?;
    let master = parse_capa_reply(&reply)?;
    info!(
        "Handshake: source is Dragonfly (replication id {}, sync id {}, {} flow(s), protocol v{})",
        master.replication_id, master.sync_id, master.num_flows, master.protocol_version
    );

    // A checkpoint from a reinitialized source is discarded without error;
    // the replication id is the source's identity.
    let resume_lsns: Option<Vec<u64>> = match resume {
        Some(cp) if cp.matches(&master) => Some(cp.flow_lsns.clone()),
        Some(cp) => {
            info!(
                "Discarding checkpoint for replication id {} (source now reports {}); full sync",
                cp.replication_id, master.replication_id
            );
            None
        }
        None => None,
    };

    // Step 5: open one FLOW per shard. A checkpointed run offers its saved
    // LSNs; if any flow refuses (FULL), everything is redone without them.
    let mut flows = open_flows(cfg, tuning, &master, resume_lsns.as_deref()).await?;
    let mut full_sync = flows.iter().any(|f| f.sync_type == SyncType::Full);

    if full_sync && resume_lsns.is_some() {
        info!("Source demoted the resume to a full sync; reopening flows without positions");
        // The half-negotiated connections are useless now.
        drop(flows);
        flows = open_flows(cfg, tuning, &master, None).await?;
        full_sync = true;
    }

    Ok(HandshakeOutcome {
        master,
        control,
        flows,
        full_sync,
    })
}

/// Tells the source to begin streaming the snapshot on every FLOW.
pub async fn start_sync(control: &mut SourceConnection) -> Result<(), RiptideError> {
    let reply = control
        .request(&[Bytes::from_static(b"DFLY"), Bytes::from_static(b"SYNC")])
        .await?;
    expect_simple(&reply, "OK")?;
    info!("DFLY SYNC acknowledged; source is streaming the snapshot");
    Ok(())
}

/// Tells the source to switch every FLOW to the stable journal stream. Only
/// safe once every FLOW has passed the snapshot barrier.
pub async fn start_stable(control: &mut SourceConnection) -> Result<(), RiptideError> {
    let reply = control
        .request(&[
            Bytes::from_static(b"DFLY"),
            Bytes::from_static(b"STARTSTABLE"),
        ])
        .await?;
    expect_simple(&reply, "OK")?;
    info!("DFLY STARTSTABLE acknowledged; stable replication begins");
    Ok(())
}

async fn connect(
    cfg: &SourceConfig,
    tuning: SocketTuning,
) -> Result<SourceConnection, RiptideError> {
    let mut conn = SourceConnection::connect(
        &cfg.addr,
        cfg.connect_timeout,
        cfg.control_timeout,
        tuning,
    )
    .await?;
    if let Some(password) = &cfg.password {
        conn.authenticate(password).await?;
    }
    Ok(conn)
}

async fn open_flows(
    cfg: &SourceConfig,
    tuning: SocketTuning,
    master: &MasterInfo,
    resume_lsns: Option<&[u64]>,
) -> Result<Vec<FlowHandshake>, RiptideError> {
    let mut flows = Vec::with_capacity(master.num_flows);
    for index in 0..master.num_flows {
        let mut conn = connect(cfg, tuning).await?;

        let mut args = vec![
            Bytes::from_static(b"DFLY"),
            Bytes::from_static(b"FLOW"),
            Bytes::from(master.replication_id.clone()),
            Bytes::from(master.sync_id.clone()),
            Bytes::from(index.to_string()),
        ];
        if let Some(lsns) = resume_lsns {
            args.push(Bytes::from(lsns[index].to_string()));
        }

        let reply = conn.request(&args).await?;
        let (sync_type, eof_token) = parse_flow_reply(index, &reply)?;
        debug!(
            "FLOW {index}: {:?} sync, eof token of {} byte(s)",
            sync_type,
            eof_token.len()
        );

        flows.push(FlowHandshake {
            index,
            sync_type,
            eof_token,
            connection: conn,
        });
    }
    Ok(flows)
}

/// Parses the `REPLCONF capa` reply. Dragonfly answers with
/// `[replicationID, syncID, numFlows, protocolVersion]`; anything shorter is
/// a legacy Redis host pretending.
fn parse_capa_reply(reply: &RespFrame) -> Result<MasterInfo, RiptideError> {
    let RespFrame::Array(parts) = reply else {
        if let RespFrame::Error(e) = reply {
            return Err(RiptideError::Remote(format!(
                "source rejected REPLCONF capa: {e}"
            )));
        }
        return Err(not_a_dragonfly(reply));
    };
    if parts.len() < 4 {
        return Err(not_a_dragonfly(reply));
    }

    let replication_id = match parts[0].as_bulk() {
        Some(b) if !b.is_empty() => String::from_utf8_lossy(b).to_string(),
        _ => return Err(not_a_dragonfly(reply)),
    };
    let sync_id = match parts[1].as_bulk() {
        Some(b) if !b.is_empty() => String::from_utf8_lossy(b).to_string(),
        _ => return Err(not_a_dragonfly(reply)),
    };
    let num_flows = parts[2]
        .as_u64()
        .ok_or_else(|| not_a_dragonfly(reply))? as usize;
    let protocol_version = parts[3].as_u64().ok_or_else(|| not_a_dragonfly(reply))?;

    if num_flows == 0 {
        return Err(RiptideError::Protocol(
            "source reports zero shards; nothing to replicate".into(),
        ));
    }

    Ok(MasterInfo {
        replication_id,
        sync_id,
        protocol_version,
        num_flows,
    })
}

/// Parses the `DFLY FLOW` reply: `[FULL|PARTIAL, eofToken]`. PARTIAL replies
/// carry no token since no snapshot will be streamed.
fn parse_flow_reply(index: usize, reply: &RespFrame) -> Result<(SyncType, Bytes), RiptideError> {
    let RespFrame::Array(parts) = reply else {
        if let RespFrame::Error(e) = reply {
            return Err(RiptideError::Remote(format!(
                "source rejected DFLY FLOW {index}: {e}"
            )));
        }
        return Err(RiptideError::Protocol(format!(
            "unexpected DFLY FLOW {index} reply: {reply:?}"
        )));
    };

    let kind = match parts.first() {
        Some(RespFrame::SimpleString(s)) => s.clone(),
        Some(RespFrame::BulkString(b)) => String::from_utf8_lossy(b).to_string(),
        _ => {
            return Err(RiptideError::Protocol(format!(
                "DFLY FLOW {index} reply carries no sync type"
            )));
        }
    };

    match kind.to_ascii_uppercase().as_str() {
        "FULL" => {
            let token = parts
                .get(1)
                .and_then(|f| f.as_bulk())
                .cloned()
                .ok_or_else(|| {
                    RiptideError::Protocol(format!("DFLY FLOW {index} FULL reply has no EOF token"))
                })?;
            if token.is_empty() {
                return Err(RiptideError::Protocol(format!(
                    "DFLY FLOW {index} returned an empty EOF token"
                )));
            }
            Ok((SyncType::Full, token))
        }
        "PARTIAL" => Ok((SyncType::Partial, Bytes::new())),
        other => Err(RiptideError::Protocol(format!(
            "DFLY FLOW {index} returned unknown sync type {other:?}"
        ))),
    }
}

fn not_a_dragonfly(reply: &RespFrame) -> RiptideError {
    RiptideError::Protocol(format!(
        "source is not a Dragonfly: REPLCONF capa answered {reply:?}"
    ))
}

fn expect_simple(reply: &RespFrame, expected: &str) -> Result<(), RiptideError> {
    match reply {
        RespFrame::SimpleString(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
        RespFrame::Error(e) => Err(RiptideError::Remote(format!(
            "source returned error: {e}"
        ))),
        other => Err(RiptideError::Protocol(format!(
            "expected '{expected}', got: {other:?}"
        ))),
    }
}
