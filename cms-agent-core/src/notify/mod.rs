//! Best-effort fan-out of run outcomes.
//!
//! Each sink delivery runs in its own task under its own timeout. Failures
//! are logged and reported back through [`DispatchHandle`] but never retried
//! and never surface to the orchestrator.

mod chat;
mod mail;
mod webhook;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    error::{AgentError, NotifyError},
    orchestrator::{Outcome, OutcomeStatus},
};

pub use chat::{ChatSink, ChatSinkConfig};
pub use mail::{MailSink, MailSinkConfig};
pub use webhook::{WebhookSink, WebhookSinkConfig};

const DEFAULT_SINK_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, outcome: &Outcome) -> Result<(), NotifyError>;
}

/// Statuses a sink receives unless configured otherwise.
pub fn default_statuses() -> Vec<OutcomeStatus> {
    vec![
        OutcomeStatus::Updated,
        OutcomeStatus::Failed,
        OutcomeStatus::Invalid,
    ]
}

pub(crate) fn default_timeout_secs() -> u64 {
    DEFAULT_SINK_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Mail(MailSinkConfig),
    Chat(ChatSinkConfig),
    Webhook(WebhookSinkConfig),
}

impl SinkConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkConfig::Mail(_) => "mail",
            SinkConfig::Chat(_) => "chat",
            SinkConfig::Webhook(_) => "webhook",
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(match self {
            SinkConfig::Mail(c) => c.timeout_secs,
            SinkConfig::Chat(c) => c.timeout_secs,
            SinkConfig::Webhook(c) => c.timeout_secs,
        })
    }

    pub fn statuses(&self) -> &[OutcomeStatus] {
        match self {
            SinkConfig::Mail(c) => &c.statuses,
            SinkConfig::Chat(c) => &c.statuses,
            SinkConfig::Webhook(c) => &c.statuses,
        }
    }

    /// Every URL this sink posts to.
    pub fn urls(&self) -> Vec<&str> {
        match self {
            SinkConfig::Mail(c) => vec![c.relay_url.as_str()],
            SinkConfig::Chat(c) => vec![c.webhook_url.as_str()],
            SinkConfig::Webhook(c) => vec![c.url.as_str()],
        }
    }
}

struct RegisteredSink {
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
    statuses: Vec<OutcomeStatus>,
}

impl RegisteredSink {
    fn accepts(&self, status: OutcomeStatus) -> bool {
        self.statuses.contains(&status)
    }
}

#[derive(Default)]
pub struct NotificationDispatcher {
    sinks: Vec<RegisteredSink>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> =
            self.sinks.iter().map(|entry| entry.sink.name()).collect();
        f.debug_struct("NotificationDispatcher")
            .field("sinks", &names)
            .finish()
    }
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[SinkConfig]) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder().build().map_err(|err| {
            AgentError::Configuration(format!(
                "failed to build notification HTTP client: {err}"
            ))
        })?;

        let mut dispatcher = Self::new();
        for config in configs {
            let sink: Arc<dyn NotificationSink> = match config {
                SinkConfig::Mail(c) => {
                    Arc::new(MailSink::new(http.clone(), c.clone()))
                }
                SinkConfig::Chat(c) => {
                    Arc::new(ChatSink::new(http.clone(), c.clone()))
                }
                SinkConfig::Webhook(c) => {
                    Arc::new(WebhookSink::new(http.clone(), c.clone()))
                }
            };
            dispatcher.register(
                sink,
                config.timeout(),
                config.statuses().to_vec(),
            );
        }
        Ok(dispatcher)
    }

    pub fn register(
        &mut self,
        sink: Arc<dyn NotificationSink>,
        timeout: Duration,
        statuses: Vec<OutcomeStatus>,
    ) {
        self.sinks.push(RegisteredSink {
            sink,
            timeout,
            statuses,
        });
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Spawns one delivery task per interested sink and returns without
    /// waiting for any of them.
    pub fn dispatch(&self, outcome: &Outcome) -> DispatchHandle {
        let outcome = Arc::new(outcome.clone());
        let deliveries = self
            .sinks
            .iter()
            .filter(|entry| entry.accepts(outcome.status))
            .map(|entry| {
                let sink = Arc::clone(&entry.sink);
                let timeout = entry.timeout;
                let outcome = Arc::clone(&outcome);
                let name = sink.name().to_string();
                let handle = tokio::spawn(deliver(sink, timeout, outcome));
                (name, handle)
            })
            .collect();

        DispatchHandle { deliveries }
    }
}

async fn deliver(
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
    outcome: Arc<Outcome>,
) -> Result<(), String> {
    let result = match tokio::time::timeout(timeout, sink.deliver(&outcome))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout(timeout)),
    };

    match &result {
        Ok(()) => debug!(
            sink = sink.name(),
            run_id = %outcome.run_id,
            status = outcome.status.as_str(),
            "notification delivered"
        ),
        Err(err) => warn!(
            sink = sink.name(),
            run_id = %outcome.run_id,
            error = %err,
            "notification delivery failed"
        ),
    }
    result.map_err(|err| err.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDelivery {
    pub sink: String,
    pub result: Result<(), String>,
}

/// In-flight deliveries of one dispatch. Dropping it detaches the tasks.
#[derive(Debug)]
pub struct DispatchHandle {
    deliveries: Vec<(String, JoinHandle<Result<(), String>>)>,
}

impl DispatchHandle {
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub async fn join(self) -> Vec<SinkDelivery> {
        let (names, handles): (Vec<_>, Vec<_>) =
            self.deliveries.into_iter().unzip();
        join_all(handles)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, sink)| SinkDelivery {
                sink,
                result: joined
                    .unwrap_or_else(|err| Err(format!("sink task failed: {err}"))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Outcome;
    use tokio::sync::mpsc;

    struct Recording {
        name: &'static str,
        tx: mpsc::UnboundedSender<OutcomeStatus>,
    }

    #[async_trait]
    impl NotificationSink for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn deliver(&self, outcome: &Outcome) -> Result<(), NotifyError> {
            let _ = self.tx.send(outcome.status);
            Ok(())
        }
    }

    struct Hanging;

    #[async_trait]
    impl NotificationSink for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn deliver(&self, _outcome: &Outcome) -> Result<(), NotifyError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl NotificationSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _outcome: &Outcome) -> Result<(), NotifyError> {
            Err(NotifyError::Status(500))
        }
    }

    fn all_statuses() -> Vec<OutcomeStatus> {
        vec![
            OutcomeStatus::UpToDate,
            OutcomeStatus::Updated,
            OutcomeStatus::Failed,
            OutcomeStatus::Invalid,
            OutcomeStatus::Busy,
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn slow_and_failing_sinks_do_not_affect_others() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(
            Arc::new(Hanging),
            Duration::from_secs(2),
            all_statuses(),
        );
        dispatcher.register(
            Arc::new(Failing),
            Duration::from_secs(2),
            all_statuses(),
        );
        dispatcher.register(
            Arc::new(Recording { name: "ok", tx }),
            Duration::from_secs(2),
            all_statuses(),
        );

        let outcome = Outcome::test_fixture(OutcomeStatus::Failed);
        let handle = dispatcher.dispatch(&outcome);
        assert_eq!(rx.recv().await, Some(OutcomeStatus::Failed));

        let results = handle.join().await;
        assert_eq!(results.len(), 3);
        let by_name = |name: &str| {
            results.iter().find(|d| d.sink == name).unwrap().result.clone()
        };
        assert!(by_name("hanging").unwrap_err().contains("timed out"));
        assert!(by_name("failing").unwrap_err().contains("500"));
        assert_eq!(by_name("ok"), Ok(()));
    }

    #[tokio::test]
    async fn sinks_only_receive_statuses_they_subscribe_to() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(
            Arc::new(Recording { name: "updates", tx }),
            Duration::from_secs(1),
            default_statuses(),
        );

        let quiet = dispatcher.dispatch(&Outcome::test_fixture(
            OutcomeStatus::UpToDate,
        ));
        assert!(quiet.is_empty());

        dispatcher
            .dispatch(&Outcome::test_fixture(OutcomeStatus::Updated))
            .join()
            .await;
        assert_eq!(rx.recv().await, Some(OutcomeStatus::Updated));
    }

    #[test]
    fn sink_configs_deserialize_with_defaults() {
        #[derive(Deserialize)]
        struct Doc {
            sinks: Vec<SinkConfig>,
        }

        let doc: Doc = config_fixture();
        assert_eq!(doc.sinks.len(), 3);
        assert_eq!(doc.sinks[0].kind(), "chat");
        assert_eq!(doc.sinks[0].statuses(), default_statuses().as_slice());
        assert_eq!(doc.sinks[1].timeout(), Duration::from_secs(3));
        assert_eq!(doc.sinks[2].statuses(), &[OutcomeStatus::Failed]);
    }

    fn config_fixture<T: serde::de::DeserializeOwned>() -> T {
        serde_json::from_value(serde_json::json!({
            "sinks": [
                {"kind": "chat", "webhook_url": "https://hooks.example.com/T0"},
                {"kind": "webhook", "url": "https://ops.example.com/hook", "timeout_secs": 3},
                {
                    "kind": "mail",
                    "relay_url": "https://mail.example.com/send",
                    "from": "agent@example.com",
                    "recipients": ["ops@example.com"],
                    "statuses": ["failed"]
                }
            ]
        }))
        .unwrap()
    }
}
