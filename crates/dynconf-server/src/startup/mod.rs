//! Process startup: logging and shutdown signals

mod logging;
mod shutdown;

pub use logging::{LOG_FILE_NAME, LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, wait_for_shutdown_signal};
