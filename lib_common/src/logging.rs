//! The pluggable log sink: stdout by default, or a CloudWatch-like sink
//! that carries a sequence token guarded by a mutex with a bounded (3s)
//! acquire timeout.
//!
//! The wire format used to ship log events is a simplified JSON POST rather
//! than the full CloudWatch Logs SigV4 API — no crate in the workspace
//! implements AWS request signing, so a plain authenticated POST stands in
//! for it. What is modeled faithfully is the contract: one mutable
//! sequence token, one mutex, one bounded timeout, fallback to stderr on
//! any failure.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{Level, LevelFilter, Log, Metadata, Record};

const SEQ_TOKEN_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Installs [`BridgeLogger`] as the global `log` backend at the requested
/// verbosity. `verbose` maps to `Info`, `debug` to `Debug`; otherwise only
/// `Warn`/`Error` are enabled.
pub fn init(verbose: bool, debug: bool, cloudwatch: Option<CloudWatchSink>) {
    let filter = if debug {
        LevelFilter::Debug
    } else if verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    let logger = BridgeLogger { cloudwatch };
    log::set_max_level(filter);
    if log::set_boxed_logger(Box::new(logger)).is_err() {
        eprintln!("logger already installed; continuing with the existing one");
    }
}

struct BridgeLogger {
    cloudwatch: Option<CloudWatchSink>,
}

impl Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match &self.cloudwatch {
            None => println!(
                "[{} - {}] {} - {}",
                std::thread::current().name().unwrap_or("main"),
                chrono::Local::now(),
                record.level(),
                record.args()
            ),
            Some(sink) => sink.emit(record.level(), &record.args().to_string()),
        }
    }

    fn flush(&self) {}
}

/// A CloudWatch-like sink: one log group/stream, one mutable sequence
/// token, guarded by a mutex with a bounded acquire timeout.
pub struct CloudWatchSink {
    endpoint: String,
    log_group: String,
    log_stream: String,
    client: reqwest::blocking::Client,
    seq_token: Mutex<Option<String>>,
}

impl CloudWatchSink {
    pub fn new(endpoint: impl Into<String>, log_group: impl Into<String>, log_stream: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            log_group: log_group.into(),
            log_stream: log_stream.into(),
            client: reqwest::blocking::Client::new(),
            seq_token: Mutex::new(None),
        }
    }

    /// `log::Log::log()` is a synchronous trait method, but callers are
    /// almost always running on a tokio worker thread (every handler logs
    /// from inside an async fn). `block_in_place` hands this thread's other
    /// tasks off to the rest of the pool for the duration of the blocking
    /// HTTP call, the same pattern the WebSocket/action-cable channel code
    /// uses around its own blocking sections.
    fn emit(&self, level: Level, message: &str) {
        tokio::task::block_in_place(|| self.emit_blocking(level, message))
    }

    fn emit_blocking(&self, level: Level, message: &str) {
        let Some(mut guard) = Self::try_lock_with_timeout(&self.seq_token) else {
            eprintln!("[logger] could not acquire sequence-token lock within 3s; dropping to stderr");
            eprintln!("{level} - {message}");
            return;
        };

        let body = serde_json::json!({
            "logGroupName": self.log_group,
            "logStreamName": self.log_stream,
            "sequenceToken": guard.clone(),
            "logEvents": [{
                "timestamp": chrono::Utc::now().timestamp_millis(),
                "message": format!("{level} - {message}"),
            }],
        });

        match self
            .client
            .post(format!("{}/put_log_events", self.endpoint))
            .json(&body)
            .send()
        {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(parsed) = resp.json::<serde_json::Value>() {
                    if let Some(next) = parsed.get("nextSequenceToken").and_then(|v| v.as_str()) {
                        *guard = Some(next.to_string());
                    }
                }
            }
            Ok(resp) => {
                eprintln!("[logger] CloudWatch sink returned {}; falling back", resp.status());
                eprintln!("{level} - {message}");
            }
            Err(e) => {
                eprintln!("[logger] CloudWatch sink unreachable ({e}); falling back");
                eprintln!("{level} - {message}");
            }
        }
    }

    /// Spin-wait for the mutex up to `SEQ_TOKEN_ACQUIRE_TIMEOUT`, since
    /// `std::sync::Mutex` has no native timed-lock API.
    fn try_lock_with_timeout(
        mutex: &Mutex<Option<String>>,
    ) -> Option<std::sync::MutexGuard<'_, Option<String>>> {
        let deadline = Instant::now() + SEQ_TOKEN_ACQUIRE_TIMEOUT;
        loop {
            if let Ok(guard) = mutex.try_lock() {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
