//! End-to-end: a fake two-shard Dragonfly source streams a snapshot and a
//! journal; the engine replicates everything into a fake standalone Redis
//! target, saves a checkpoint, and exits cleanly when both flows FIN.

mod common;

use bytes::{Bytes, BytesMut};
use riptide::config::{
    CheckpointConfig, Config, ReplicationConfig, SourceConfig, StatusConfig, TargetConfig,
    TargetMode,
};
use riptide::core::checkpoint::Checkpoint;
use riptide::core::journal::codec::JournalEntry;
use riptide::core::protocol::RespFrame;
use riptide::core::replication::supervisor::{RunOutcome, Supervisor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const REPLID: &str = "11aa22bb33cc44dd55ee66ff77889900aabbccdd";
const NUM_FLOWS: usize = 2;

fn flow_token(index: usize) -> Vec<u8> {
    format!("{index:0>32}").into_bytes()
}

/// The per-flow payloads the fake source streams after SYNC / STARTSTABLE.
struct FlowScript {
    rdb: Vec<u8>,
    journal: Vec<u8>,
}

fn build_scripts() -> Vec<FlowScript> {
    let rdb0 = common::RdbStreamBuilder::new()
        .select_db(0)
        .string_entry(b"alpha", b"1")
        .string_entry(b"gamma", b"3")
        .finish(&flow_token(0));
    let journal0 = common::build_journal(&[
        common::journal_command(1, 0, &["SET", "live:a", "x"]),
        JournalEntry::Lsn { lsn: 2 },
        common::journal_command(3, 0, &["SET", "live:b", "y"]),
    ]);

    let rdb1 = common::RdbStreamBuilder::new()
        .select_db(0)
        .string_entry(b"beta", b"2")
        .expire_ms(4_000_000_000_000) // far future, must survive
        .string_entry(b"delta", b"4")
        .finish(&flow_token(1));
    let journal1 = common::build_journal(&[
        common::journal_command(1, 0, &["SET", "live:c", "z"]),
        JournalEntry::Expired {
            lsn: 2,
            db_index: 0,
            key: Bytes::from_static(b"beta"),
        },
    ]);

    vec![
        FlowScript {
            rdb: rdb0,
            journal: journal0,
        },
        FlowScript {
            rdb: rdb1,
            journal: journal1,
        },
    ]
}

/// Spawns the fake source. Control connections answer the handshake; FLOW
/// connections are parked until SYNC/STARTSTABLE trigger their payloads.
async fn spawn_fake_dragonfly(scripts: Vec<FlowScript>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bindable");
    let addr = listener.local_addr().expect("local addr").to_string();

    let scripts = Arc::new(scripts);
    let flow_sockets: Arc<tokio::sync::Mutex<HashMap<usize, TcpStream>>> =
        Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let scripts = scripts.clone();
            let flow_sockets = flow_sockets.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while let Some(args) = common::read_command(&mut stream, &mut buf).await {
                    let name = String::from_utf8_lossy(&args[0]).to_uppercase();
                    match name.as_str() {
                        "PING" => common::write_simple(&mut stream, "PONG").await,
                        "REPLCONF" => {
                            let sub = String::from_utf8_lossy(&args[1]).to_lowercase();
                            if sub == "capa" {
                                let reply = RespFrame::Array(vec![
                                    common::bulk(REPLID),
                                    common::bulk("SYNC1"),
                                    RespFrame::Integer(NUM_FLOWS as i64),
                                    RespFrame::Integer(1),
                                ]);
                                common::write_frame(&mut stream, reply).await;
                            } else {
                                common::write_simple(&mut stream, "OK").await;
                            }
                        }
                        "DFLY" => {
                            let sub = String::from_utf8_lossy(&args[1]).to_uppercase();
                            match sub.as_str() {
                                "FLOW" => {
                                    let index: usize = String::from_utf8_lossy(&args[4])
                                        .parse()
                                        .expect("numeric flow index");
                                    let token = flow_token(index);
                                    let reply = RespFrame::Array(vec![
                                        common::bulk("FULL"),
                                        RespFrame::BulkString(Bytes::from(token)),
                                    ]);
                                    common::write_frame(&mut stream, reply).await;
                                    // This connection is now flow `index`;
                                    // hand it to the control handler.
                                    flow_sockets.lock().await.insert(index, stream);
                                    return;
                                }
                                "SYNC" => {
                                    common::write_simple(&mut stream, "OK").await;
                                    let mut sockets = flow_sockets.lock().await;
                                    for (index, socket) in sockets.iter_mut() {
                                        socket
                                            .write_all(&scripts[*index].rdb)
                                            .await
                                            .expect("flow socket writable");
                                    }
                                }
                                "STARTSTABLE" => {
                                    common::write_simple(&mut stream, "OK").await;
                                    let mut sockets = flow_sockets.lock().await;
                                    for (index, socket) in sockets.iter_mut() {
                                        socket
                                            .write_all(&scripts[*index].journal)
                                            .await
                                            .expect("flow socket writable");
                                    }
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

    addr
}

/// Spawns the fake standalone target and returns its address plus the
/// recorded write commands.
async fn spawn_fake_redis() -> (String, Arc<Mutex<Vec<Vec<String>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bindable");
    let addr = listener.local_addr().expect("local addr").to_string();
    let commands: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = commands.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while let Some(args) = common::read_command(&mut stream, &mut buf).await {
                    let args: Vec<String> = args
                        .iter()
                        .map(|a| String::from_utf8_lossy(a).to_string())
                        .collect();
                    let reply = match args[0].to_uppercase().as_str() {
                        "CLUSTER" => RespFrame::Error(
                            "ERR This instance has cluster support disabled".to_string(),
                        ),
                        "EXISTS" => RespFrame::Integer(0),
                        _ => {
                            recorded.lock().unwrap().push(args.clone());
                            RespFrame::SimpleString("OK".to_string())
                        }
                    };
                    common::write_frame(&mut stream, reply).await;
                }
            });
        }
    });

    (addr, commands)
}

fn engine_config(source_addr: &str, target_addr: &str, checkpoint_path: &str) -> Config {
    Config {
        log_level: "warn".to_string(),
        source: SourceConfig {
            addr: source_addr.to_string(),
            password: None,
            announce_ip: None,
            announce_port: None,
            connect_timeout: Duration::from_secs(2),
            control_timeout: Duration::from_secs(5),
            keepalive: Duration::from_secs(1),
            recv_buffer_bytes: 256 * 1024,
        },
        target: TargetConfig {
            addr: target_addr.to_string(),
            password: None,
            mode: TargetMode::Auto,
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(5),
            node_reconnect_attempts: 1,
        },
        replication: ReplicationConfig::default(),
        checkpoint: CheckpointConfig {
            path: checkpoint_path.to_string(),
            interval: Duration::from_millis(200),
        },
        status: StatusConfig::default(),
    }
}

#[tokio::test]
async fn test_full_sync_replicates_snapshot_and_journal() {
    let source_addr = spawn_fake_dragonfly(build_scripts()).await;
    let (target_addr, recorded) = spawn_fake_redis().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoint_path = dir.path().join("checkpoint.json");
    let checkpoint_path = checkpoint_path.to_str().expect("utf8 path");

    let config = engine_config(&source_addr, &target_addr, checkpoint_path);
    let supervisor = Supervisor::new(config);

    let outcome = tokio::time::timeout(Duration::from_secs(30), supervisor.run())
        .await
        .expect("run finishes")
        .expect("run succeeds");
    assert_eq!(outcome, RunOutcome::Completed);

    let received = recorded.lock().unwrap().clone();

    // Snapshot keys from both shards arrived.
    let set_keys: Vec<&str> = received
        .iter()
        .filter(|c| c[0] == "SET")
        .map(|c| c[1].as_str())
        .collect();
    for key in ["alpha", "gamma", "beta", "delta", "live:a", "live:b", "live:c"] {
        assert!(set_keys.contains(&key), "missing SET for {key}: {set_keys:?}");
    }

    // The volatile snapshot key kept its absolute expiry.
    assert!(
        received
            .iter()
            .any(|c| c[0] == "PEXPIREAT" && c[1] == "delta"),
        "missing PEXPIREAT for delta"
    );

    // The journal EXPIRED record became a delete.
    assert!(
        received.iter().any(|c| c[0] == "DEL" && c[1] == "beta"),
        "missing DEL for beta"
    );

    // Per-flow journal order: live:a before live:b (both on flow 0).
    let idx_a = received.iter().position(|c| c[1] == "live:a").expect("live:a");
    let idx_b = received.iter().position(|c| c[1] == "live:b").expect("live:b");
    assert!(idx_a < idx_b, "flow 0 journal order violated");

    // A final checkpoint exists with the fully advanced positions.
    let checkpoint = Checkpoint::load(checkpoint_path)
        .await
        .expect("loadable")
        .expect("present");
    assert_eq!(checkpoint.replication_id, REPLID);
    assert_eq!(checkpoint.num_flows, NUM_FLOWS);
    assert!(checkpoint.flow_lsns[0] >= 3, "flow 0 lsn: {:?}", checkpoint.flow_lsns);
    assert!(checkpoint.flow_lsns[1] >= 2, "flow 1 lsn: {:?}", checkpoint.flow_lsns);
}
