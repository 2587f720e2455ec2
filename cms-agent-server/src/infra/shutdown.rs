use std::time::Duration;

use cms_agent_core::{Agent, ShutdownReport};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How long in-flight requests get to unwind once their runs are aborted.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Waits for the HTTP server task to drain its open requests. Past `grace`
/// the agent's abort token fires so manually triggered runs give up, and if
/// the server still has not stopped after that its task is aborted.
pub async fn drain_server(
    server: &mut JoinHandle<std::io::Result<()>>,
    agent: &Agent,
    grace: Duration,
) -> ShutdownReport {
    match tokio::time::timeout(grace, &mut *server).await {
        Ok(Ok(Ok(()))) => {
            info!("http server drained");
            ShutdownReport::Clean
        }
        Ok(Ok(Err(err))) => {
            error!(error = %err, "http server failed while draining");
            ShutdownReport::Unclean
        }
        Ok(Err(err)) => {
            error!(error = %err, "http server task did not exit normally");
            ShutdownReport::Unclean
        }
        Err(_) => {
            error!(
                dataset = agent.dataset_id(),
                grace = %humantime::format_duration(grace),
                "unclean shutdown: requests still in flight after grace period, aborting runs"
            );
            agent.abort_token().cancel();
            if tokio::time::timeout(ABORT_GRACE, &mut *server).await.is_err() {
                server.abort();
            }
            ShutdownReport::Unclean
        }
    }
}
