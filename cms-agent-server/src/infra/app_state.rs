use std::{fmt, sync::Arc};

use cms_agent_config::CorsConfig;
use cms_agent_core::Agent;

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub cors: Arc<CorsConfig>,
}

impl AppState {
    pub fn new(agent: Arc<Agent>, cors: CorsConfig) -> Self {
        Self {
            agent,
            cors: Arc::new(cors),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("dataset_id", &self.agent.dataset_id())
            .finish_non_exhaustive()
    }
}
