mod common;

use bytes::BytesMut;
use riptide::config::SourceConfig;
use riptide::core::checkpoint::Checkpoint;
use riptide::core::protocol::RespFrame;
use riptide::core::source::connection::SocketTuning;
use riptide::core::source::{SyncType, handshake};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

const REPLID: &str = "f0e1d2c3b4a5968778695a4b3c2d1e0f12345678";

#[derive(Clone, Copy, PartialEq)]
enum SourceMode {
    /// Answers FULL on every FLOW.
    FullOnly,
    /// Answers PARTIAL whenever the FLOW command carries an LSN.
    HonorPartial,
    /// Pretends to be a legacy Redis: a short array for REPLCONF capa.
    LegacyRedis,
}

struct FakeSource {
    addr: SocketAddr,
    /// Number of DFLY FLOW commands that carried an LSN argument.
    flows_with_lsn: Arc<AtomicUsize>,
    /// Total DFLY FLOW commands seen.
    flows_total: Arc<AtomicUsize>,
}

async fn spawn_fake_source(num_flows: usize, mode: SourceMode) -> FakeSource {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bindable");
    let addr = listener.local_addr().expect("local addr");
    let flows_with_lsn = Arc::new(AtomicUsize::new(0));
    let flows_total = Arc::new(AtomicUsize::new(0));

    let with_lsn = flows_with_lsn.clone();
    let total = flows_total.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let with_lsn = with_lsn.clone();
            let total = total.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while let Some(args) = common::read_command(&mut stream, &mut buf).await {
                    let name = String::from_utf8_lossy(&args[0]).to_uppercase();
                    match name.as_str() {
                        "PING" => common::write_simple(&mut stream, "PONG").await,
                        "REPLCONF" => {
                            let sub = String::from_utf8_lossy(&args[1]).to_lowercase();
                            if sub == "capa" {
                                let reply = if mode == SourceMode::LegacyRedis {
                                    RespFrame::Array(vec![common::bulk(REPLID), common::bulk("0")])
                                } else {
                                    RespFrame::Array(vec![
                                        common::bulk(REPLID),
                                        common::bulk("SYNC1"),
                                        RespFrame::Integer(num_flows as i64),
                                        RespFrame::Integer(1),
                                    ])
                                };
                                common::write_frame(&mut stream, reply).await;
                            } else {
                                common::write_simple(&mut stream, "OK").await;
                            }
                        }
                        "DFLY" => {
                            let sub = String::from_utf8_lossy(&args[1]).to_uppercase();
                            match sub.as_str() {
                                "FLOW" => {
                                    total.fetch_add(1, Ordering::SeqCst);
                                    let has_lsn = args.len() > 5;
                                    if has_lsn {
                                        with_lsn.fetch_add(1, Ordering::SeqCst);
                                    }
                                    let index = String::from_utf8_lossy(&args[4]).to_string();
                                    let reply = if mode == SourceMode::HonorPartial && has_lsn {
                                        RespFrame::Array(vec![common::bulk("PARTIAL")])
                                    } else {
                                        let token = format!("{index:0>32}");
                                        RespFrame::Array(vec![
                                            common::bulk("FULL"),
                                            common::bulk(&token),
                                        ])
                                    };
                                    common::write_frame(&mut stream, reply).await;
                                }
                                _ => common::write_simple(&mut stream, "OK").await,
                            }
                        }
                        _ => common::write_simple(&mut stream, "OK").await,
                    }
                }
            });
        }
    });

    FakeSource {
        addr,
        flows_with_lsn,
        flows_total,
    }
}

fn source_config(addr: SocketAddr) -> SourceConfig {
    SourceConfig {
        addr: addr.to_string(),
        password: None,
        announce_ip: None,
        announce_port: None,
        connect_timeout: Duration::from_secs(2),
        control_timeout: Duration::from_secs(2),
        keepalive: Duration::from_secs(1),
        recv_buffer_bytes: 256 * 1024,
    }
}

fn tuning() -> SocketTuning {
    SocketTuning {
        keepalive: Duration::from_secs(1),
        recv_buffer_bytes: 256 * 1024,
    }
}

fn checkpoint(replid: &str, lsns: &[u64]) -> Checkpoint {
    Checkpoint {
        version: riptide::core::checkpoint::CHECKPOINT_VERSION,
        replication_id: replid.to_string(),
        sync_id: "SYNC1".to_string(),
        num_flows: lsns.len(),
        flow_lsns: lsns.to_vec(),
        updated_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_handshake_happy_path_with_four_shards() {
    let fake = spawn_fake_source(4, SourceMode::FullOnly).await;
    let outcome = handshake::perform(&source_config(fake.addr), tuning(), None)
        .await
        .expect("handshake succeeds");

    assert_eq!(outcome.master.num_flows, 4);
    assert!(!outcome.master.replication_id.is_empty());
    assert_eq!(outcome.master.sync_id, "SYNC1");
    assert_eq!(outcome.flows.len(), 4);
    assert!(outcome.full_sync);
    for (i, flow) in outcome.flows.iter().enumerate() {
        assert_eq!(flow.index, i);
        assert_eq!(flow.sync_type, SyncType::Full);
        assert!(flow.eof_token.len() >= 16);
    }
}

#[tokio::test]
async fn test_legacy_redis_source_is_rejected() {
    let fake = spawn_fake_source(4, SourceMode::LegacyRedis).await;
    let err = handshake::perform(&source_config(fake.addr), tuning(), None)
        .await
        .expect_err("legacy host must be rejected");
    assert!(err.to_string().contains("not a Dragonfly"));
}

#[tokio::test]
async fn test_matching_checkpoint_resumes_partially() {
    let fake = spawn_fake_source(2, SourceMode::HonorPartial).await;
    let cp = checkpoint(REPLID, &[17, 23]);
    let outcome = handshake::perform(&source_config(fake.addr), tuning(), Some(&cp))
        .await
        .expect("handshake succeeds");

    assert!(!outcome.full_sync);
    assert!(outcome.flows.iter().all(|f| f.sync_type == SyncType::Partial));
    assert_eq!(fake.flows_with_lsn.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_mismatched_checkpoint_is_discarded_without_error() {
    let fake = spawn_fake_source(2, SourceMode::HonorPartial).await;
    let cp = checkpoint("some-other-run-entirely-0000000000000000", &[17, 23]);
    let outcome = handshake::perform(&source_config(fake.addr), tuning(), Some(&cp))
        .await
        .expect("a stale checkpoint never fails the handshake");

    assert!(outcome.full_sync);
    // The stale positions were never offered to the source.
    assert_eq!(fake.flows_with_lsn.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_source_demoting_partial_reopens_flows_without_positions() {
    let fake = spawn_fake_source(3, SourceMode::FullOnly).await;
    let cp = checkpoint(REPLID, &[1, 2, 3]);
    let outcome = handshake::perform(&source_config(fake.addr), tuning(), Some(&cp))
        .await
        .expect("handshake succeeds");

    assert!(outcome.full_sync);
    assert!(outcome.flows.iter().all(|f| f.sync_type == SyncType::Full));
    // First round offered positions, the redo did not.
    assert_eq!(fake.flows_with_lsn.load(Ordering::SeqCst), 3);
    assert_eq!(fake.flows_total.load(Ordering::SeqCst), 6);
}
