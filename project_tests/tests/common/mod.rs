use std::collections::HashMap;
use std::sync::Mutex;

use lib_common::errors::ConfigError;
use lib_common::paramstore::ParamStore;

/// An in-memory stand-in for the hierarchical parameter store, so
/// `Settings::load_ssm` / `migrate_ini_to_ssm` can be exercised without a
/// live HTTPS endpoint.
#[derive(Default)]
pub struct MockParamStore {
    values: Mutex<HashMap<String, String>>,
}

impl MockParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.lock().unwrap().clone()
    }
}

impl ParamStore for MockParamStore {
    async fn get_parameter(&self, path: &str) -> Result<String, ConfigError> {
        self.values
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ConfigError::ParamStore(format!("no such parameter: {path}")))
    }

    async fn put_parameter(&self, path: &str, value: &str) -> Result<(), ConfigError> {
        self.values
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_string());
        Ok(())
    }
}

pub const SAMPLE_INI: &str = r#"
[aws_mq]
mq_broker_id = b-1234
mq_port = 5671
mq_user_id = bridgeuser
mq_password = hunter2
mq_region = us-east-1
mq_qname_to_ws = q_in
mq_qname_from_ws = q_out
mq_ttl_from_ws = 300
mq_consumer_tag = mqhandler

[ws_api]
api_host = wss://example.execute-api.us-east-1.amazonaws.com
api_uri = /prod
client_id = client-abc
client_secret = 00ff00ff
ws_ping_interval = 30
ws_max_connect_attempts = 5
ws_attempt_window_secs = 300

[aws_cloudwatch]
cw_region = us-east-1
cw_log_group = /mq2wsbridge/log
cw_log_stream = instance-1
cw_retention_days = 14
cw_metrics_namespace = mq2wsbridge
cw_metrics_resolution = 60
"#;
