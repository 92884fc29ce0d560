//! Setup-time error types.
//!
//! A narrow `thiserror` enum at the configuration-loading boundary;
//! callers further up convert into `anyhow` for anything that only needs
//! to bubble up and be reported.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration mechanism specified; cannot bring up bridge")]
    NoSource,

    #[error("missing required key [{section}] {key}")]
    MissingKey { section: &'static str, key: &'static str },

    #[error("invalid value for [{section}] {key}: {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        reason: String,
    },

    #[error("queue names not specified in configuration")]
    MissingQueueNames,

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("INI parse error: {0}")]
    Ini(#[from] ini::Error),

    #[error("parameter store error: {0}")]
    ParamStore(String),

    #[error("migration requested without a parameter-store region")]
    MigrateWithoutSsm,
}
