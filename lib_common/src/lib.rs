//! Shared collaborators for the mq2wsbridge workspace: settings loading
//! (INI file or parameter store), the pluggable log sink, and small
//! process/instance identity helpers.

pub mod errors;
pub mod logging;
pub mod paramstore;
pub mod settings;
pub mod util;

pub use errors::ConfigError;
pub use settings::Settings;
