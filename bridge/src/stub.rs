//! Stub WebSocket Handler: a loopback stand-in used by `bridgetester` and
//! the `--websocket-stub` run mode, avoiding any real network endpoint
//! while still exercising the full Broker Handler <-> forward-callback
//! path. Wired through the same trait/callback seam as its live
//! counterpart, so the Supervisor can swap one for the other transparently.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, OnceCell};

use crate::model::{ConnectionState, Counters, ForwardFn};

/// Default delay before a stub send is delivered to the forward callback,
/// so a run exercising ordering/timing doesn't see instantaneous delivery a
/// real network round-trip would never produce. A field on the handler
/// rather than a bare constant, so callers (loopback tests) can drive it
/// to zero.
const DEFAULT_STUB_SEND_DELAY: Duration = Duration::from_millis(5);

pub struct StubWebSocketHandler {
    pub state: Arc<ConnectionState>,
    counters: Arc<Counters>,
    forward: OnceCell<ForwardFn>,
    send_delay: Duration,
}

impl StubWebSocketHandler {
    pub fn new(counters: Arc<Counters>) -> Arc<Self> {
        Self::with_send_delay(counters, DEFAULT_STUB_SEND_DELAY)
    }

    pub fn with_send_delay(counters: Arc<Counters>, send_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: ConnectionState::new(),
            counters,
            forward: OnceCell::new(),
            send_delay,
        })
    }

    pub fn set_forward(&self, forward: ForwardFn) {
        let _ = self.forward.set(forward);
    }

    /// Immediately marks itself running and connected, then parks until
    /// told to shut down. There is no real connection to maintain.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        self.state.set_running(true);
        self.state.set_connected(true);
        log::info!("WebSocket stub handler running (no network endpoint)");

        let _ = shutdown.recv().await;
        self.state.set_connected(false);
        self.state.set_running(false);
        log::info!("Exiting WebSocket stub handler");
    }

    /// Delivers `body` straight back to the forward callback (normally the
    /// Broker Handler's `publish`) after `send_delay`, counting both the
    /// outbound and the looped-back inbound frame.
    pub async fn send(&self, body: Vec<u8>) -> bool {
        self.counters.to_ws.fetch_add(1, Ordering::Relaxed);
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }

        let Some(forward) = self.forward.get() else {
            log::error!("WebSocket stub has no forward callback wired; dropping frame");
            return false;
        };
        let ok = forward(body).await;
        if ok {
            self.counters.from_ws.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub async fn close(&self) {
        self.state.set_running(false);
        self.state.set_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// With the send delay at zero, the sequence delivered to the forward
    /// callback equals the sequence sent via `send`, in order.
    #[tokio::test]
    async fn loopback_mirrors_sent_sequence_in_order() {
        let counters = Counters::new();
        let stub = StubWebSocketHandler::with_send_delay(counters.clone(), Duration::ZERO);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_for_forward = received.clone();
        stub.set_forward(Arc::new(move |body| {
            let received = received_for_forward.clone();
            Box::pin(async move {
                received.lock().unwrap().push(body);
                true
            })
        }));

        let sent: Vec<Vec<u8>> = (0..5).map(|n| format!("frame-{n}").into_bytes()).collect();
        for body in &sent {
            assert!(stub.send(body.clone()).await);
        }

        assert_eq!(*received.lock().unwrap(), sent);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.to_ws, 5);
        assert_eq!(snapshot.from_ws, 5);
    }

    #[tokio::test]
    async fn send_without_forward_wired_reports_failure_without_panicking() {
        let counters = Counters::new();
        let stub = StubWebSocketHandler::with_send_delay(counters.clone(), Duration::ZERO);
        assert!(!stub.send(b"orphan".to_vec()).await);
        assert_eq!(counters.snapshot().to_ws, 1);
        assert_eq!(counters.snapshot().from_ws, 0);
    }
}
