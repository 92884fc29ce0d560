//! Small process/instance identity helpers used by the metrics reporter.

use std::time::Duration;

use static_init::dynamic;

const METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/instance-id";
const METADATA_TIMEOUT: Duration = Duration::from_millis(250);

/// Process-wide instance id, resolved once before `main` runs
/// (`static_init::dynamic`, the same pre-main singleton shape
/// `config_cloud.rs` uses for `CLOUD_CONFIG`) so the blocking metadata probe
/// never runs on a thread that already owns a tokio runtime.
#[dynamic]
pub static INSTANCE_ID: String = resolve_instance_id();

fn resolve_instance_id() -> String {
    probe_metadata_instance_id().unwrap_or_else(|| format!("local-{}", local_hostname()))
}

fn probe_metadata_instance_id() -> Option<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()
        .ok()?;
    let resp = client.get(METADATA_URL).send().ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body = resp.text().ok()?;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// The current process id, used as a metrics dimension alongside
/// `instance_id`.
pub fn process_id() -> u32 {
    std::process::id()
}
