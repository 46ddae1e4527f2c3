//! Ambient helpers shared across modules: logging setup, shutdown signal
//! handling, and safe time access.

pub mod logging;
pub mod signal;
pub mod time;

pub use logging::{init_logging, init_logging_from_config, init_module_logging};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use signal::{create_shutdown_receiver, wait_for_shutdown_signal};
pub use time::{current_timestamp, current_timestamp_duration};
