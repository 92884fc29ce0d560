//! Metrics Reporter: periodically samples the shared [`Counters`] and
//! emits a CloudWatch-like metric pair per counter, tagged with
//! `instance_id`/`pid` dimensions: `_total` (the cumulative value) plus
//! either `_persecond` (`to_ws`/`from_ws`, the delta divided by
//! `resolution`) or `_recent` (the connect-attempt counters, the raw
//! undivided delta).
//!
//! The same narrow-interface, fail-quietly contract as
//! `lib_common::logging::CloudWatchSink` applies here, reusing
//! `lib_common::util::INSTANCE_ID`/`process_id()` for the dimensions.
//! Unlike the log sink, the sampling loop is itself async, so this uses an
//! async `reqwest::Client` rather than the blocking one the synchronous
//! `log::Log::log()` call forces on the log sink.

use std::sync::Arc;
use std::time::Duration;

use lib_common::util::{process_id, INSTANCE_ID};

use crate::model::{ConnectionState, CounterSnapshot, Counters};

pub struct MetricsReporter {
    counters: Arc<Counters>,
    sink: Option<MetricsSink>,
    resolution: Duration,
}

impl MetricsReporter {
    pub fn new(counters: Arc<Counters>, sink: Option<MetricsSink>, resolution_secs: u64) -> Self {
        Self {
            counters,
            sink,
            resolution: Duration::from_secs(resolution_secs.max(1)),
        }
    }

    /// Samples every `resolution` while `state.is_running()`, diffing
    /// against the previous sample to report a per-second rate alongside
    /// the running total. Errors from the sink are logged and swallowed;
    /// a metrics outage must never interrupt the bridge itself.
    pub async fn run(self, state: Arc<ConnectionState>) {
        let Some(sink) = &self.sink else {
            log::info!("no metrics sink configured; metrics reporter idle");
            return;
        };

        let mut previous = self.counters.snapshot();
        let mut interval = tokio::time::interval(self.resolution);
        interval.tick().await;

        while state.is_running() {
            interval.tick().await;
            let current = self.counters.snapshot();
            let elapsed_secs = self.resolution.as_secs_f64().max(1.0);

            let samples = diff_samples(&previous, &current, elapsed_secs);
            if let Err(e) = sink.emit(&samples).await {
                log::warn!("metrics sink unreachable ({e}); dropping this sample");
            }
            previous = current;
        }
    }
}

/// Which second metric accompanies a counter's `_total`: `to_ws`/`from_ws`
/// report a `_persecond` rate (the delta divided by `resolution`);
/// `broker_connect_attempts`/`ws_connect_attempts` report a raw `_recent`
/// delta instead (per spec.md §4.5 and the original's
/// `mq_connection_attempts_recent`/`ws_connection_attempts_recent`).
enum Delta {
    PerSecond(f64),
    Recent(u64),
}

struct Sample {
    name: &'static str,
    total: u64,
    delta: Delta,
}

fn diff_samples(previous: &CounterSnapshot, current: &CounterSnapshot, elapsed_secs: f64) -> Vec<Sample> {
    vec![
        Sample {
            name: "to_ws",
            total: current.to_ws,
            delta: Delta::PerSecond(current.to_ws.saturating_sub(previous.to_ws) as f64 / elapsed_secs),
        },
        Sample {
            name: "from_ws",
            total: current.from_ws,
            delta: Delta::PerSecond(current.from_ws.saturating_sub(previous.from_ws) as f64 / elapsed_secs),
        },
        Sample {
            name: "broker_connect_attempts",
            total: current.broker_connect_attempts,
            delta: Delta::Recent(current.broker_connect_attempts.saturating_sub(previous.broker_connect_attempts)),
        },
        Sample {
            name: "ws_connect_attempts",
            total: current.ws_connect_attempts,
            delta: Delta::Recent(current.ws_connect_attempts.saturating_sub(previous.ws_connect_attempts)),
        },
    ]
}

/// An HTTP sink for metric samples: a simplified, non-SigV4 JSON protocol
/// against the same conceptual endpoint `HttpParamStore`/`CloudWatchSink`
/// use.
pub struct MetricsSink {
    endpoint: String,
    namespace: String,
    client: reqwest::Client,
}

impl MetricsSink {
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
        }
    }

    async fn emit(&self, samples: &[Sample]) -> Result<(), reqwest::Error> {
        let dimensions = serde_json::json!({
            "instance_id": INSTANCE_ID.as_str(),
            "pid": process_id(),
        });

        let metric_data: Vec<serde_json::Value> = samples
            .iter()
            .flat_map(|s| {
                let (suffix, value) = match s.delta {
                    Delta::PerSecond(v) => ("persecond", serde_json::json!(v)),
                    Delta::Recent(v) => ("recent", serde_json::json!(v)),
                };
                [
                    serde_json::json!({
                        "metricName": format!("{}_total", s.name),
                        "value": s.total,
                        "dimensions": dimensions,
                    }),
                    serde_json::json!({
                        "metricName": format!("{}_{suffix}", s.name),
                        "value": value,
                        "dimensions": dimensions,
                    }),
                ]
            })
            .collect();

        let body = serde_json::json!({
            "namespace": self.namespace,
            "metricData": metric_data,
        });

        let resp = self
            .client
            .post(format!("{}/put_metric_data", self.endpoint))
            .json(&body)
            .send()
            .await?;
        resp.error_for_status().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_counters_divide_by_resolution_connect_counters_do_not() {
        let previous = CounterSnapshot {
            to_ws: 10,
            from_ws: 4,
            broker_connect_attempts: 1,
            ws_connect_attempts: 2,
        };
        let current = CounterSnapshot {
            to_ws: 20,
            from_ws: 4,
            broker_connect_attempts: 3,
            ws_connect_attempts: 2,
        };

        let samples = diff_samples(&previous, &current, 5.0);

        let to_ws = samples.iter().find(|s| s.name == "to_ws").unwrap();
        assert!(matches!(to_ws.delta, Delta::PerSecond(v) if v == 2.0));

        let broker = samples.iter().find(|s| s.name == "broker_connect_attempts").unwrap();
        assert!(matches!(broker.delta, Delta::Recent(2)));

        let ws = samples.iter().find(|s| s.name == "ws_connect_attempts").unwrap();
        assert!(matches!(ws.delta, Delta::Recent(0)));
    }
}
