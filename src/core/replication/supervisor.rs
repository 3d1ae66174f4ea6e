// src/core/replication/supervisor.rs

//! Owns the life of a replication run: handshake, snapshot stage with its
//! barrier, the switch to stable replication, the background tasks, and the
//! wind-down on completion, fatal error, or shutdown.

use crate::config::Config;
use crate::core::RiptideError;
use crate::core::checkpoint::Checkpoint;
use crate::core::cluster::Router;
use crate::core::events::{EventBus, ProgressEvent, Stage};
use crate::core::journal::codec::JournalDecoder;
use crate::core::journal::replayer::{self, JournalApplier};
use crate::core::metrics::Metrics;
use crate::core::replication::{FlowSession, FlowState, SyncBarrier};
use crate::core::snapshot::apply::SnapshotApplier;
use crate::core::snapshot::rdb::RdbDecoder;
use crate::core::snapshot::reader;
use crate::core::source::connection::SocketTuning;
use crate::core::source::{FlowHandshake, HandshakeOutcome, handshake};
use crate::core::tasks::{CheckpointSaverTask, StatusSinkTask};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every FLOW delivered FIN; the source has nothing more to send.
    Completed,
    /// The user asked for a shutdown and the engine wound down cleanly.
    Cancelled,
}

/// Bound on how long wind-down waits for child tasks before aborting them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Supervisor {
    config: Config,
    metrics: Arc<Metrics>,
    events: EventBus,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config,
            metrics: Arc::new(Metrics::default()),
            events: EventBus::new(),
            shutdown_tx,
        }
    }

    /// A handle the signal layer uses to initiate graceful shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Runs the whole pipeline to completion. Does not return before every
    /// child task has observed the shutdown and exited (or the bounded drain
    /// timeout forced them).
    pub async fn run(self) -> Result<RunOutcome, RiptideError> {
        let flow_registry: Arc<RwLock<Vec<Arc<FlowSession>>>> = Arc::new(RwLock::new(Vec::new()));
        let mut background: JoinSet<()> = JoinSet::new();

        // The status sink subscribes before any event is published.
        let sink = StatusSinkTask {
            config: self.config.status.clone(),
            metrics: self.metrics.clone(),
            flows: flow_registry.clone(),
            events: self.events.clone(),
        };
        let sink_shutdown = self.shutdown_tx.subscribe();
        background.spawn(sink.run(sink_shutdown));

        let result = self.run_pipeline(&flow_registry, &mut background).await;

        match &result {
            Ok(RunOutcome::Completed) => {
                self.events.publish(ProgressEvent::StageChanged {
                    stage: Stage::Completed,
                    message: "replication completed".to_string(),
                });
            }
            Ok(RunOutcome::Cancelled) => {
                self.events.publish(ProgressEvent::StageChanged {
                    stage: Stage::Completed,
                    message: "shutdown requested; replication stopped".to_string(),
                });
            }
            Err(e) => {
                self.events.publish(ProgressEvent::Fatal {
                    message: e.to_string(),
                });
            }
        }

        // Wake everything still parked on the shutdown channel, then wait
        // for it, bounded.
        let _ = self.shutdown_tx.send(());
        drain_background(&mut background).await;

        result
    }

    async fn run_pipeline(
        &self,
        flow_registry: &Arc<RwLock<Vec<Arc<FlowSession>>>>,
        background: &mut JoinSet<()>,
    ) -> Result<RunOutcome, RiptideError> {
        self.events.publish(ProgressEvent::StageChanged {
            stage: Stage::Starting,
            message: format!("connecting to target {}", self.config.target.addr),
        });

        let router = Arc::new(
            Router::connect(self.config.target.clone(), self.metrics.clone()).await?,
        );

        self.events.publish(ProgressEvent::StageChanged {
            stage: Stage::Handshake,
            message: format!("handshaking with source {}", self.config.source.addr),
        });

        let resume = Checkpoint::load(&self.config.checkpoint.path).await?;
        let tuning = SocketTuning {
            keepalive: self.config.source.keepalive,
            recv_buffer_bytes: self.config.source.recv_buffer_bytes,
        };
        let HandshakeOutcome {
            master,
            mut control,
            flows: flow_handshakes,
            full_sync,
        } = handshake::perform(&self.config.source, tuning, resume.as_ref()).await?;

        self.events.publish(ProgressEvent::HandshakeComplete {
            replication_id: master.replication_id.clone(),
            num_flows: master.num_flows,
        });

        // A partial resume starts every FLOW at its checkpointed position;
        // a full sync starts from zero.
        let initial_lsns: Vec<u64> = if !full_sync {
            resume
                .as_ref()
                .map(|cp| cp.flow_lsns.clone())
                .unwrap_or_else(|| vec![0; master.num_flows])
        } else {
            vec![0; master.num_flows]
        };

        let flows: Vec<Arc<FlowSession>> = flow_handshakes
            .iter()
            .map(|f| Arc::new(FlowSession::new(f.index, f.eof_token.clone(), initial_lsns[f.index])))
            .collect();
        *flow_registry.write() = flows.clone();

        let mut flow_tasks: JoinSet<Result<usize, RiptideError>> = JoinSet::new();

        if full_sync {
            self.events.publish(ProgressEvent::StageChanged {
                stage: Stage::Snapshot,
                message: format!("ingesting snapshot on {} flow(s)", master.num_flows),
            });

            let barrier = Arc::new(SyncBarrier::new(master.num_flows));
            let (entry_tx, entry_rx) =
                mpsc::channel(self.config.replication.entry_channel_capacity);

            let applier = SnapshotApplier {
                router: router.clone(),
                metrics: self.metrics.clone(),
                policy: self.config.replication.conflict_policy,
                batch_limit: self.config.snapshot_batch_size(router.is_cluster()),
                chunk_size: self.config.replication.value_chunk_size,
            };
            let mut sink_handle: JoinHandle<Result<(), RiptideError>> =
                tokio::spawn(applier.run(entry_rx));

            handshake::start_sync(&mut control).await?;

            for flow_handshake in flow_handshakes {
                let flow = flows[flow_handshake.index].clone();
                flow_tasks.spawn(full_sync_worker(
                    flow,
                    flow_handshake,
                    entry_tx.clone(),
                    barrier.clone(),
                    router.clone(),
                    self.metrics.clone(),
                    self.events.clone(),
                    self.config.clone(),
                    self.shutdown_tx.clone(),
                ));
            }
            drop(entry_tx);

            // Wait for every FLOW to reach the barrier. Any worker or sink
            // failure before that point aborts the session.
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    _ = barrier.released() => break,
                    Some(joined) = flow_tasks.join_next() => {
                        // A worker coming back this early either failed
                        // (fatal) or raced a FIN right past the barrier
                        // release, which the next iteration observes.
                        match flatten_worker(joined) {
                            Ok(finished) => {
                                self.events.publish(ProgressEvent::FlowFinished { flow: finished });
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    sink_res = &mut sink_handle => {
                        flatten_sink(sink_res)?;
                        return Err(RiptideError::Internal(
                            "snapshot sink exited while flows were still streaming".into(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        // Let the workers observe the cancellation and the
                        // sink flush its in-flight batch before returning.
                        drain_flow_tasks(&mut flow_tasks).await;
                        if tokio::time::timeout(DRAIN_TIMEOUT, &mut sink_handle).await.is_err() {
                            sink_handle.abort();
                        }
                        return Ok(RunOutcome::Cancelled);
                    }
                }
            }

            self.events.publish(ProgressEvent::BarrierReleased);
            info!("All {} flow(s) passed the snapshot barrier", master.num_flows);

            // The sink drains whatever is left in the entry channel, then
            // exits; its failure is fatal even this late.
            flatten_sink(sink_handle.await)?;

            handshake::start_stable(&mut control).await?;
        } else {
            info!("Partial resume accepted on every flow; skipping the snapshot stage");
            for flow in &flows {
                flow.advance_state(FlowState::Stable)?;
            }
            for flow_handshake in flow_handshakes {
                let flow = flows[flow_handshake.index].clone();
                flow_tasks.spawn(partial_sync_worker(
                    flow,
                    flow_handshake,
                    router.clone(),
                    self.metrics.clone(),
                    self.events.clone(),
                    self.config.clone(),
                    self.shutdown_tx.clone(),
                ));
            }
            handshake::start_stable(&mut control).await?;
        }

        self.events.publish(ProgressEvent::StableStarted);
        self.events.publish(ProgressEvent::StageChanged {
            stage: Stage::Stable,
            message: "stable replication running".to_string(),
        });

        // Positions are only meaningful once the snapshot is fully applied,
        // so the checkpoint keeper starts here.
        let saver = CheckpointSaverTask {
            path: self.config.checkpoint.path.clone(),
            interval: self.config.checkpoint.interval,
            master: master.clone(),
            flows: flows.clone(),
            metrics: self.metrics.clone(),
            events: self.events.clone(),
        };
        let saver_shutdown = self.shutdown_tx.subscribe();
        background.spawn(saver.run(saver_shutdown));

        // Stable stage: run until every FLOW sees FIN, a worker fails, or
        // shutdown arrives.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                joined = flow_tasks.join_next() => {
                    match joined {
                        Some(joined) => {
                            let flow_index = flatten_worker(joined)?;
                            self.events.publish(ProgressEvent::FlowFinished { flow: flow_index });
                            info!("FLOW {flow_index} finished its journal");
                        }
                        None => {
                            info!("Every flow finished; replication run complete");
                            return Ok(RunOutcome::Completed);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested; stopping stable replication");
                    // The journal workers flush their in-flight batches on
                    // the way out; wait for them, bounded.
                    drain_flow_tasks(&mut flow_tasks).await;
                    return Ok(RunOutcome::Cancelled);
                }
            }
        }
    }
}

/// One FLOW's full-sync worker: snapshot phase, barrier, then the journal.
#[allow(clippy::too_many_arguments)]
async fn full_sync_worker(
    flow: Arc<FlowSession>,
    flow_handshake: FlowHandshake,
    entry_tx: mpsc::Sender<crate::core::snapshot::RdbEntry>,
    barrier: Arc<SyncBarrier>,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    events: EventBus,
    config: Config,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<usize, RiptideError> {
    let index = flow.index;
    let result = async {
        let stream = flow_handshake.connection.into_stream();
        let decoder = RdbDecoder::new(stream, flow.eof_token.clone());

        let decoder = reader::run_snapshot_phase(
            flow.clone(),
            decoder,
            entry_tx,
            barrier,
            metrics.clone(),
            events.clone(),
            shutdown_tx.subscribe(),
        )
        .await?;

        let (stream, leftover) = decoder.into_parts();
        run_journal_phase(
            flow.clone(),
            JournalDecoder::with_leftover(stream, leftover),
            router,
            metrics,
            &config,
            shutdown_tx,
        )
        .await
    }
    .await;

    report_worker_result(index, result, &flow, &events)
}

/// One FLOW's partial-resume worker: journal only.
async fn partial_sync_worker(
    flow: Arc<FlowSession>,
    flow_handshake: FlowHandshake,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    events: EventBus,
    config: Config,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<usize, RiptideError> {
    let index = flow.index;
    let stream = flow_handshake.connection.into_stream();
    let result = run_journal_phase(
        flow.clone(),
        JournalDecoder::new(stream),
        router,
        metrics,
        &config,
        shutdown_tx,
    )
    .await;

    report_worker_result(index, result, &flow, &events)
}

/// The stable phase of one FLOW: a decode loop feeding a bounded channel and
/// a batching apply loop draining it.
async fn run_journal_phase(
    flow: Arc<FlowSession>,
    decoder: JournalDecoder<crate::core::source::SourceStream>,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    config: &Config,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<usize, RiptideError> {
    let index = flow.index;
    let (tx, rx) = mpsc::channel(config.replication.journal_channel_capacity);

    let applier = JournalApplier {
        flow: flow.clone(),
        router,
        metrics: metrics.clone(),
        batch_limit: config.replication.journal_batch_size,
    };
    let apply_handle = tokio::spawn(applier.run(rx));

    let decode_result =
        replayer::decode_loop(index, decoder, tx, metrics, shutdown_tx.subscribe()).await;

    // The decode loop dropped its sender, so the applier flushes what is in
    // flight and exits; its result matters even when decoding was cancelled.
    let apply_result = apply_handle
        .await
        .map_err(|e| RiptideError::Internal(format!("flow {index} apply task panicked: {e}")))?;

    apply_result?;
    decode_result?;

    flow.advance_state(FlowState::Closed)?;
    Ok(index)
}

/// Publishes worker failures on the event bus and passes the result through.
fn report_worker_result(
    index: usize,
    result: Result<usize, RiptideError>,
    flow: &Arc<FlowSession>,
    events: &EventBus,
) -> Result<usize, RiptideError> {
    if let Err(e) = &result {
        if !matches!(e, RiptideError::Cancelled) {
            error!("FLOW {index} failed: {e}");
            events.publish(ProgressEvent::ReplayError {
                flow: index,
                message: e.to_string(),
            });
        }
        let _ = flow.advance_state(FlowState::Closed);
    }
    result
}

/// Normalizes a JoinSet result: task panics become internal errors,
/// cancellations pass through untouched.
fn flatten_worker(
    joined: Result<Result<usize, RiptideError>, tokio::task::JoinError>,
) -> Result<usize, RiptideError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(RiptideError::Internal(format!("flow worker panicked: {e}"))),
    }
}

fn flatten_sink(
    joined: Result<Result<(), RiptideError>, tokio::task::JoinError>,
) -> Result<(), RiptideError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(RiptideError::Internal(format!(
            "snapshot sink panicked: {e}"
        ))),
    }
}

/// Waits for the flow workers to observe cancellation and exit, bounded.
async fn drain_flow_tasks(flow_tasks: &mut JoinSet<Result<usize, RiptideError>>) {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(joined) = flow_tasks.join_next().await {
            match flatten_worker(joined) {
                Ok(_) | Err(RiptideError::Cancelled) => {}
                Err(e) => warn!("Flow worker failed during shutdown: {e}"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Flow workers did not stop within {DRAIN_TIMEOUT:?}; aborting them");
        flow_tasks.abort_all();
    }
}

/// Waits for the background tasks (status sink, checkpoint keeper), bounded,
/// aborting whatever overstays.
async fn drain_background(background: &mut JoinSet<()>) {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while background.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Background tasks did not stop within {DRAIN_TIMEOUT:?}; aborting them");
        background.abort_all();
    }
}
