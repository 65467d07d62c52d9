//! Main entry point for the dynconf agent.

use dynconf_server::{Configuration, run, startup};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    let shutdown = startup::wait_for_shutdown_signal();
    if let Err(e) = run(&configuration, &shutdown).await {
        error!(error = %e, "Agent failed");
        return Err(e);
    }
    Ok(())
}
