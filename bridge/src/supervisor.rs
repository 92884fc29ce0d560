//! Bridge Supervisor: starts the broker, WebSocket and metrics tasks,
//! wires them together through the `ForwardFn` seam, polls for readiness,
//! watches for worker death, and drives shutdown from either a signal, a
//! `--runsecs` timer, or an explicit call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use lib_common::Settings;

use crate::broker::BrokerHandler;
use crate::metrics::{MetricsReporter, MetricsSink};
use crate::model::Counters;
use crate::stub::StubWebSocketHandler;
use crate::websocket::LiveWebSocketHandler;

const READY_POLL_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const WATCH_INTERVAL: Duration = Duration::from_secs(3);
/// Default per-worker join timeout on shutdown. A field on the Supervisor
/// rather than a bare constant, so tests can shrink it instead of waiting
/// out a stuck worker.
const DEFAULT_WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

enum WebSocketSide {
    Live(Arc<LiveWebSocketHandler>),
    Stub(Arc<StubWebSocketHandler>),
}

pub struct BridgeSupervisor {
    settings: Settings,
    counters: Arc<Counters>,
    broker: Arc<BrokerHandler>,
    ws: WebSocketSide,
    metrics: Option<MetricsReporter>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    join_timeout: Duration,
}

impl BridgeSupervisor {
    pub fn new(settings: Settings, use_stub: bool, metrics_sink: Option<MetricsSink>) -> Self {
        let counters = Counters::new();
        let broker = BrokerHandler::new(settings.clone(), counters.clone());
        let ws = if use_stub {
            WebSocketSide::Stub(StubWebSocketHandler::new(counters.clone()))
        } else {
            WebSocketSide::Live(LiveWebSocketHandler::new(settings.clone(), counters.clone()))
        };
        let metrics = MetricsReporter::new(counters.clone(), metrics_sink, settings.cw_metrics_resolution);
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            settings,
            counters,
            broker,
            ws,
            metrics: Some(metrics),
            shutdown_tx,
            workers: Vec::new(),
            join_timeout: DEFAULT_WORKER_JOIN_TIMEOUT,
        }
    }

    /// Overrides the per-worker join timeout used by `shutdown()`.
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Wires the Broker Handler's consumed frames to the WebSocket side's
    /// `send`, and the WebSocket side's received frames to the Broker
    /// Handler's `publish` against Q_OUT.
    fn wire_forwarding(&self) {
        let qname_from_ws = self.settings.mq_qname_from_ws.clone();
        let broker_for_ws = self.broker.clone();
        match &self.ws {
            WebSocketSide::Live(ws) => {
                let ws_for_broker = ws.clone();
                self.broker
                    .set_forward(Arc::new(move |body| {
                        let ws = ws_for_broker.clone();
                        Box::pin(async move { ws.send(body).await })
                    }));
                ws.set_forward(Arc::new(move |body| {
                    let broker = broker_for_ws.clone();
                    let queue = qname_from_ws.clone();
                    Box::pin(async move { broker.publish(&queue, body).await })
                }));
            }
            WebSocketSide::Stub(ws) => {
                let ws_for_broker = ws.clone();
                self.broker
                    .set_forward(Arc::new(move |body| {
                        let ws = ws_for_broker.clone();
                        Box::pin(async move { ws.send(body).await })
                    }));
                ws.set_forward(Arc::new(move |body| {
                    let broker = broker_for_ws.clone();
                    let queue = qname_from_ws.clone();
                    Box::pin(async move { broker.publish(&queue, body).await })
                }));
            }
        }
    }

    /// Launches the worker tasks (metrics, broker, websocket-or-stub) and
    /// polls up to [`READY_POLL_TIMEOUT`] for both sides to report
    /// `running ∧ connected`. Returns once ready or once the timeout
    /// elapses (the caller decides whether that's fatal).
    pub async fn start(&mut self) -> bool {
        self.wire_forwarding();

        let metrics_state = self.broker.state.clone();
        let metrics = self.metrics.take().expect("start() called more than once");
        self.workers.push(tokio::spawn(async move {
            metrics.run(metrics_state).await;
        }));

        let broker = self.broker.clone();
        let broker_shutdown = self.shutdown_tx.subscribe();
        self.workers.push(tokio::spawn(async move {
            broker.run(broker_shutdown).await;
        }));

        match &self.ws {
            WebSocketSide::Live(ws) => {
                let ws = ws.clone();
                let ws_shutdown = self.shutdown_tx.subscribe();
                self.workers.push(tokio::spawn(async move {
                    ws.run(ws_shutdown).await;
                }));
            }
            WebSocketSide::Stub(ws) => {
                let ws = ws.clone();
                let ws_shutdown = self.shutdown_tx.subscribe();
                self.workers.push(tokio::spawn(async move {
                    ws.run(ws_shutdown).await;
                }));
            }
        }

        self.wait_ready().await
    }

    async fn wait_ready(&self) -> bool {
        let deadline = Instant::now() + READY_POLL_TIMEOUT;
        loop {
            // The broker handler has no separate `connected` signal of its own
            // (spec.md §3: it exposes connectedness implicitly via `running`).
            let broker_ready = self.broker.state.is_running();
            let ws_ready = match &self.ws {
                WebSocketSide::Live(ws) => ws.state.is_running() && ws.state.is_connected(),
                WebSocketSide::Stub(ws) => ws.state.is_running() && ws.state.is_connected(),
            };
            if broker_ready && ws_ready {
                log::info!("bridge is up: broker and WebSocket side both running and connected");
                return true;
            }
            if self.broker.state.is_failed() {
                log::error!(
                    "broker handler failed during startup: {}",
                    self.broker.state.failed_reason().unwrap_or_default()
                );
                return false;
            }
            let ws_state = match &self.ws {
                WebSocketSide::Live(ws) => &ws.state,
                WebSocketSide::Stub(ws) => &ws.state,
            };
            if ws_state.is_failed() {
                log::error!(
                    "WebSocket handler failed during startup: {}",
                    ws_state.failed_reason().unwrap_or_default()
                );
                return false;
            }
            if Instant::now() >= deadline {
                log::error!("timed out waiting for bridge to come up");
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Runs an interrupter that triggers shutdown either after `run_secs`
    /// elapses (`--runsecs`) or when told to by `external_shutdown`
    /// (signal handling), whichever comes first, then watches worker
    /// health every [`WATCH_INTERVAL`] until shutdown.
    pub async fn run(&mut self, run_secs: Option<u64>, mut external_shutdown: broadcast::Receiver<()>) {
        let deadline = run_secs.map(|s| Instant::now() + Duration::from_secs(s));

        loop {
            let timer = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = timer => {
                    log::info!("--runsecs elapsed; shutting down");
                    break;
                }
                _ = external_shutdown.recv() => {
                    log::info!("shutdown requested; shutting down");
                    break;
                }
                _ = tokio::time::sleep(WATCH_INTERVAL) => {
                    if !self.workers_alive() {
                        log::error!("a worker task exited unexpectedly; shutting down");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Per spec.md §4.1 `watch()`: a worker is healthy only if its task is
    /// still alive *and* its handler still reports `running`.
    fn workers_alive(&self) -> bool {
        let handles_alive = self.workers.iter().all(|h| !h.is_finished());
        let broker_running = self.broker.state.is_running();
        let ws_running = match &self.ws {
            WebSocketSide::Live(ws) => ws.state.is_running(),
            WebSocketSide::Stub(ws) => ws.state.is_running(),
        };
        handles_alive && broker_running && ws_running
    }

    /// Idempotent shutdown: clears `running` on both handlers, wakes every
    /// worker via the shutdown broadcast, and joins each with a bounded
    /// timeout so a stuck worker cannot hang the whole process.
    pub async fn shutdown(&mut self) {
        self.broker.close().await;
        match &self.ws {
            WebSocketSide::Live(ws) => ws.close().await,
            WebSocketSide::Stub(ws) => ws.close().await,
        }
        let _ = self.shutdown_tx.send(());

        for handle in self.workers.drain(..) {
            if tokio::time::timeout(self.join_timeout, handle).await.is_err() {
                log::warn!("worker task did not exit within {:?}; abandoning it", self.join_timeout);
            }
        }

        log::info!(
            "final counters: {:?}",
            self.counters.snapshot()
        );
    }
}
