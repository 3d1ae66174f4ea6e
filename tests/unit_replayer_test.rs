mod common;

use bytes::{Bytes, BytesMut};
use riptide::config::{TargetConfig, TargetMode};
use riptide::core::cluster::Router;
use riptide::core::journal::codec::{JournalDecoder, JournalEntry};
use riptide::core::journal::replayer::{self, JournalApplier};
use riptide::core::metrics::Metrics;
use riptide::core::protocol::RespFrame;
use riptide::core::replication::FlowSession;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// A standalone fake target that acknowledges everything and records the
/// commands it saw.
async fn spawn_ok_target() -> (String, Arc<Mutex<Vec<Vec<String>>>>) {
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

async fn standalone_router(addr: &str) -> Arc<Router> {
    let target = TargetConfig {
        addr: addr.to_string(),
        password: None,
        mode: TargetMode::Auto,
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(5),
        node_reconnect_attempts: 1,
    };
    Arc::new(
        Router::connect(target, Arc::new(Metrics::default()))
            .await
            .expect("connects"),
    )
}

#[tokio::test]
async fn test_apply_loop_preserves_order_and_advances_lsn() {
    let (addr, recorded) = spawn_ok_target().await;
    let router = standalone_router(&addr).await;
    let flow = Arc::new(FlowSession::new(0, Bytes::new(), 0));

    let applier = JournalApplier {
        flow: flow.clone(),
        router,
        metrics: Arc::new(Metrics::default()),
        batch_limit: 64,
    };
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(applier.run(rx));

    let entries = vec![
        common::journal_command(1, 0, &["SET", "a", "1"]),
        JournalEntry::Lsn { lsn: 2 },
        common::journal_command(3, 5, &["SET", "b", "2"]),
        common::journal_command(4, 5, &["SET", "c", "3"]),
        JournalEntry::Expired {
            lsn: 5,
            db_index: 0,
            key: Bytes::from_static(b"a"),
        },
    ];
    for entry in entries {
        tx.send(entry).await.expect("channel open");
    }
    drop(tx);

    handle.await.expect("no panic").expect("applier succeeds");

    // Everything dispatched, so the position includes every record seen.
    assert_eq!(flow.current_lsn(), 5);

    let received = recorded.lock().unwrap().clone();
    let summary: Vec<(String, String)> = received
        .iter()
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("SET".to_string(), "a".to_string()),
            ("SET".to_string(), "b".to_string()),
            ("SET".to_string(), "c".to_string()),
            ("DEL".to_string(), "a".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_lsn_only_stream_advances_without_writes() {
    let (addr, recorded) = spawn_ok_target().await;
    let router = standalone_router(&addr).await;
    let flow = Arc::new(FlowSession::new(0, Bytes::new(), 10));

    let applier = JournalApplier {
        flow: flow.clone(),
        router,
        metrics: Arc::new(Metrics::default()),
        batch_limit: 64,
    };
    let (tx, rx) = mpsc::channel(8);
    let handle = tokio::spawn(applier.run(rx));

    tx.send(JournalEntry::Lsn { lsn: 17 }).await.expect("open");
    tx.send(JournalEntry::Lsn { lsn: 19 }).await.expect("open");
    drop(tx);
    handle.await.expect("no panic").expect("applier succeeds");

    assert_eq!(flow.current_lsn(), 19);
    assert!(recorded.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_decode_loop_filters_bookkeeping_and_stops_on_fin() {
    let entries = vec![
        JournalEntry::Select { db_index: 1 },
        JournalEntry::Ping,
        common::journal_command(1, 0, &["SET", "x", "y"]),
        JournalEntry::Lsn { lsn: 2 },
    ];
    let stream = common::build_journal(&entries);

    let (tx, mut rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    replayer::decode_loop(
        0,
        JournalDecoder::new(&stream[..]),
        tx,
        Arc::new(Metrics::default()),
        shutdown_rx,
    )
    .await
    .expect("FIN ends the loop cleanly");

    let mut forwarded = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        forwarded.push(entry);
    }
    // SELECT, PING, and FIN are swallowed; COMMAND and LSN pass through.
    assert_eq!(forwarded.len(), 2);
    assert!(matches!(forwarded[0], JournalEntry::Command { lsn: 1, .. }));
    assert!(matches!(forwarded[1], JournalEntry::Lsn { lsn: 2 }));
}

#[tokio::test]
async fn test_corrupt_journal_is_fatal_for_the_flow() {
    let mut stream = common::build_journal(&[common::journal_command(1, 0, &["SET", "x", "y"])]);
    // Replace the trailing FIN with garbage.
    let last = stream.len() - 1;
    stream[last] = 0x77;

    let (tx, _rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let err = replayer::decode_loop(
        0,
        JournalDecoder::new(&stream[..]),
        tx,
        Arc::new(Metrics::default()),
        shutdown_rx,
    )
    .await
    .expect_err("corruption is fatal");
    assert!(err.to_string().contains("unknown opcode"));
}
