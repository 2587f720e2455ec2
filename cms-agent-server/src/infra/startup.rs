use std::sync::Arc;

use cms_agent_config::AgentConfig;
use cms_agent_core::{
    Agent, AgentError, AgentParts, CheckpointStore,
    fetch::{DatastoreClient, FetchClient},
    notify::NotificationDispatcher,
};
use tracing::info;

/// Wires the production provider client into a fresh [`Agent`].
pub async fn build_agent(config: &AgentConfig) -> Result<Arc<Agent>, AgentError> {
    let client = DatastoreClient::new(&config.provider)?;
    info!(endpoint = %client.endpoint(), "provider client ready");
    build_agent_with_client(config, Arc::new(client)).await
}

/// Same as [`build_agent`] with a caller-supplied provider client.
pub async fn build_agent_with_client(
    config: &AgentConfig,
    client: Arc<dyn FetchClient>,
) -> Result<Arc<Agent>, AgentError> {
    let store = CheckpointStore::open(config.storage.paths()).await?;
    if let Some(checkpoint) = store.current() {
        info!(
            record_count = checkpoint.record_count,
            fetched_at = %checkpoint.fetched_at,
            "resuming from checkpoint"
        );
    }
    let notifier =
        NotificationDispatcher::from_configs(&config.notifications.sinks)?;
    info!(sinks = notifier.len(), "notification sinks registered");

    Ok(Arc::new(Agent::new(AgentParts {
        dataset_id: config.provider.dataset_id.clone(),
        client,
        store: Arc::new(store),
        rules: config.validation.clone(),
        notifier,
        retry: config.retry,
        contention: config.schedule.contention,
        schedule: config.schedule.settings(),
    })))
}
