//! WebSocket Handler: connects to the signed URL, forwards inbound frames
//! to the Broker Handler, and exposes `send()` for outbound frames
//! published from Q_OUT.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio_tungstenite::tungstenite::Message;

use lib_common::Settings;

use crate::model::{ConnectionState, Counters, ForwardFn};
use crate::signing::{build_signed_url, SignedUrlInputs};

/// A connect attempt budget of `ws_max_connect_attempts` is enforced over a
/// rolling window of `ws_attempt_window_secs`; once the window elapses
/// without exhausting the budget, the counter resets.
pub struct LiveWebSocketHandler {
    settings: Settings,
    pub state: Arc<ConnectionState>,
    counters: Arc<Counters>,
    forward: OnceCell<ForwardFn>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl LiveWebSocketHandler {
    pub fn new(settings: Settings, counters: Arc<Counters>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            settings,
            state: ConnectionState::new(),
            counters,
            forward: OnceCell::new(),
            outbound_tx: tx,
            outbound_rx: tokio::sync::Mutex::new(Some(rx)),
        })
    }

    /// Wires the callback invoked for every text/binary frame received
    /// from the WebSocket (normally the Broker Handler's `publish`).
    pub fn set_forward(&self, forward: ForwardFn) {
        let _ = self.forward.set(forward);
    }

    /// Outbound send contract: if `connected ∧ running`, queue the frame
    /// for the connection task and count it; if `running` without
    /// `connected`, sleep a second (giving a reconnect a chance to land)
    /// and report failure; if not `running` at all, fail immediately.
    pub async fn send(&self, body: Vec<u8>) -> bool {
        if !self.state.is_running() {
            return false;
        }
        if !self.state.is_connected() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            return false;
        }
        if self.outbound_tx.send(body).is_ok() {
            self.counters.to_ws.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        self.state.set_running(true);

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("run() called more than once");

        let mut window_start = Instant::now();
        let mut attempts_in_window = 0u32;

        'connect: while self.state.is_running() {
            if window_start.elapsed() >= Duration::from_secs(self.settings.ws_attempt_window_secs) {
                window_start = Instant::now();
                attempts_in_window = 0;
            }

            if attempts_in_window >= self.settings.ws_max_connect_attempts {
                log::error!("exceeded WebSocket connect attempts within the attempt window");
                self.state.set_failed("exceeded max connect attempts in window");
                break 'connect;
            }
            attempts_in_window += 1;
            self.counters.ws_connect_attempts.fetch_add(1, Ordering::Relaxed);

            let inputs = SignedUrlInputs::now();
            let url = match build_signed_url(&self.settings, &inputs) {
                Ok(url) => url,
                Err(e) => {
                    log::error!("failed to build signed WebSocket URL: {e}");
                    self.state.set_failed("failed to build signed URL");
                    break 'connect;
                }
            };

            let connect_res = tokio_tungstenite::connect_async(&url).await;
            let (ws_stream, _response) = match connect_res {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("WebSocket connect failed: {e}");
                    // The session never handshook at all (the library never got far
                    // enough to hand back an open/close pair), the same condition
                    // the Python original's on_close(code=None, msg=None) observes.
                    // `record_failure` leaves `running` alone so the retry loop
                    // keeps spending the attempt budget instead of aborting here.
                    self.state.record_failure("appears to have failed to connect");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        _ = shutdown.recv() => {
                            self.state.set_running(false);
                            break 'connect;
                        }
                    }
                    continue 'connect;
                }
            };

            self.state.set_connected(true);
            log::info!("WebSocket connected");
            let (mut write, mut read) = ws_stream.split();
            let mut ping_interval = tokio::time::interval(Duration::from_secs(self.settings.ws_ping_interval));
            ping_interval.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        self.state.set_running(false);
                        self.state.set_connected(false);
                        let _ = write.send(Message::Close(None)).await;
                        break 'connect;
                    }
                    _ = ping_interval.tick() => {
                        if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                            self.state.set_connected(false);
                            continue 'connect;
                        }
                    }
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(body) => {
                                if write.send(Message::Binary(body.into())).await.is_err() {
                                    self.state.set_connected(false);
                                    continue 'connect;
                                }
                            }
                            None => {
                                // Sender side dropped; nothing more to forward out, keep reading.
                            }
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                self.on_message(text.as_bytes().to_vec()).await;
                            }
                            Some(Ok(Message::Binary(bin))) => {
                                self.on_message(bin.to_vec()).await;
                            }
                            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                            Some(Ok(Message::Close(frame))) => {
                                log::warn!("WebSocket closed by peer: {frame:?}");
                                self.state.set_connected(false);
                                continue 'connect;
                            }
                            Some(Ok(Message::Frame(_))) => {}
                            Some(Err(e)) => {
                                log::error!("WebSocket read error: {e}");
                                self.state.set_connected(false);
                                continue 'connect;
                            }
                            None => {
                                self.state.set_connected(false);
                                continue 'connect;
                            }
                        }
                    }
                }
            }
        }

        self.state.set_connected(false);
        self.state.set_running(false);
        log::info!("Exiting WebSocket handler");
    }

    async fn on_message(&self, body: Vec<u8>) {
        let Some(forward) = self.forward.get() else {
            log::error!("WebSocket handler has no forward callback wired; dropping frame");
            return;
        };
        if forward(body).await {
            self.counters.from_ws.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn close(&self) {
        self.state.set_running(false);
        self.state.set_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        Settings {
            mq_broker_id: String::new(),
            mq_port: 0,
            mq_userid: String::new(),
            mq_password: String::new(),
            mq_region: String::new(),
            mq_qname_to_ws: "q_in".into(),
            mq_qname_from_ws: "q_out".into(),
            mq_ttl_from_ws_secs: 300,
            mq_consumer_tag: "mqhandler".into(),
            mq_max_retries: 5,
            ws_api_host: "wss://h".into(),
            ws_api_uri: "/x".into(),
            ws_client_id: "cid".into(),
            ws_client_secret_hex: "00ff".into(),
            ws_ping_interval: 30,
            ws_max_connect_attempts: 5,
            ws_attempt_window_secs: 300,
            jwt_region: "ny".into(),
            cw_region: None,
            cw_log_group: None,
            cw_log_stream: None,
            cw_retention_days: 30,
            cw_metrics_namespace: None,
            cw_metrics_resolution: 60,
        }
    }

    #[tokio::test]
    async fn send_fails_immediately_when_not_running() {
        let ws = LiveWebSocketHandler::new(test_settings(), Counters::new());
        assert!(!ws.send(b"frame".to_vec()).await);
        assert_eq!(ws.counters.to_ws.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_sleeps_and_fails_when_running_but_not_connected() {
        let ws = LiveWebSocketHandler::new(test_settings(), Counters::new());
        ws.state.set_running(true);

        let started = tokio::time::Instant::now();
        assert!(!ws.send(b"frame".to_vec()).await);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(ws.counters.to_ws.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn send_queues_and_counts_when_running_and_connected() {
        let ws = LiveWebSocketHandler::new(test_settings(), Counters::new());
        ws.state.set_running(true);
        ws.state.set_connected(true);

        assert!(ws.send(b"frame".to_vec()).await);
        assert_eq!(ws.counters.to_ws.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn on_message_does_not_count_a_rejected_forward() {
        let ws = LiveWebSocketHandler::new(test_settings(), Counters::new());
        ws.set_forward(Arc::new(|_body| Box::pin(async move { false })));
        ws.on_message(b"frame".to_vec()).await;
        assert_eq!(ws.counters.from_ws.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn on_message_counts_a_successful_forward() {
        let ws = LiveWebSocketHandler::new(test_settings(), Counters::new());
        ws.set_forward(Arc::new(|_body| Box::pin(async move { true })));
        ws.on_message(b"frame".to_vec()).await;
        assert_eq!(ws.counters.from_ws.load(Ordering::Relaxed), 1);
    }
}
