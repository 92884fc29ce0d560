//! Shared state primitives: the per-handler connection state, the counters
//! the Metrics Reporter samples, and the `ForwardFn` seam both handlers are
//! wired through.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A boxed async callback: `forward(body) -> bool`. The stub and live
/// WebSocket handler are wired to the Broker Handler through this same
/// type, and vice versa, so neither handler needs to know the other's
/// concrete type.
pub type ForwardFn = Arc<dyn Fn(Vec<u8>) -> BoxFuture<bool> + Send + Sync>;
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Monotonic per-run counters. Written by at most one task each, read by
/// the Metrics Reporter; atomics, no lock needed.
#[derive(Default)]
pub struct Counters {
    pub to_ws: AtomicU64,
    pub from_ws: AtomicU64,
    pub broker_connect_attempts: AtomicU64,
    pub ws_connect_attempts: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            to_ws: self.to_ws.load(Ordering::Relaxed),
            from_ws: self.from_ws.load(Ordering::Relaxed),
            broker_connect_attempts: self.broker_connect_attempts.load(Ordering::Relaxed),
            ws_connect_attempts: self.ws_connect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub to_ws: u64,
    pub from_ws: u64,
    pub broker_connect_attempts: u64,
    pub ws_connect_attempts: u64,
}

/// The three booleans each handler exposes to the Supervisor:
/// `running`, `connected`, `failed` (with reason).
///
/// Invariants (enforced by callers, not by this type): `failed ⇒ ¬running`
/// eventually; `connected ⇒ running`.
#[derive(Default)]
pub struct ConnectionState {
    running: AtomicBool,
    connected: AtomicBool,
    failed_reason: Mutex<Option<String>>,
}

impl ConnectionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed_reason.lock().expect("state lock poisoned").is_some()
    }

    pub fn failed_reason(&self) -> Option<String> {
        self.failed_reason.lock().expect("state lock poisoned").clone()
    }

    /// Records an observed failure reason without touching `running`. Use
    /// this for a failure a retry loop should still recover from (e.g. a
    /// WebSocket session that never handshook but whose attempt budget
    /// isn't exhausted yet) — `running` stays as the caller left it, so the
    /// loop keeps retrying, while `is_failed()`/`failed_reason()` become
    /// observable to anything polling for early failure (e.g. the
    /// Supervisor's startup readiness poll).
    pub fn record_failure(&self, reason: impl Into<String>) {
        *self.failed_reason.lock().expect("state lock poisoned") = Some(reason.into());
    }

    /// Records a terminal failure and clears `running` (the
    /// `failed ⇒ ¬running` invariant).
    pub fn set_failed(&self, reason: impl Into<String>) {
        self.record_failure(reason);
        self.set_running(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn set_failed_clears_running_per_invariant() {
        let state = ConnectionState::new();
        state.set_running(true);
        state.set_connected(true);

        state.set_failed("exceeded max connect attempts");

        assert!(!state.is_running());
        assert!(state.is_failed());
        assert_eq!(state.failed_reason().as_deref(), Some("exceeded max connect attempts"));
    }

    #[test]
    fn record_failure_leaves_running_untouched() {
        let state = ConnectionState::new();
        state.set_running(true);

        state.record_failure("appears to have failed to connect");

        assert!(state.is_running());
        assert!(state.is_failed());
        assert_eq!(state.failed_reason().as_deref(), Some("appears to have failed to connect"));
    }

    #[test]
    fn fresh_state_is_not_running_connected_or_failed() {
        let state = ConnectionState::new();
        assert!(!state.is_running());
        assert!(!state.is_connected());
        assert!(!state.is_failed());
    }

    #[test]
    fn counters_are_monotonic_and_snapshot_independently() {
        let counters = Counters::new();
        counters.to_ws.fetch_add(1, Ordering::Relaxed);
        counters.from_ws.fetch_add(2, Ordering::Relaxed);

        let first = counters.snapshot();
        counters.to_ws.fetch_add(3, Ordering::Relaxed);
        let second = counters.snapshot();

        assert_eq!(first.to_ws, 1);
        assert_eq!(second.to_ws, 4);
        assert!(second.to_ws >= first.to_ws);
        assert_eq!(second.from_ws, first.from_ws);
    }
}
