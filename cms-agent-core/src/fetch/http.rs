use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{DatasetQuery, FetchClient, Payload};
use crate::error::{AgentError, FetchError};

pub const DEFAULT_BASE_URL: &str =
    "https://data.cms.gov/provider-data/api/1/datastore";
pub const DEFAULT_DATASET_ID: &str = "a678955c-467c-5df1-a8bf-c94d22c86247";

const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    pub base_url: String,
    pub dataset_id: String,
    pub request_timeout_ms: u64,
    pub auth: ProviderAuth,
}

impl DatastoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            dataset_id: DEFAULT_DATASET_ID.to_string(),
            request_timeout_ms: 30_000,
            auth: ProviderAuth::None,
        }
    }
}

/// Client for the datastore `sql` endpoint.
#[derive(Debug, Clone)]
pub struct DatastoreClient {
    http: reqwest::Client,
    endpoint: Url,
    auth: ProviderAuth,
    timeout: Duration,
}

impl DatastoreClient {
    pub fn new(config: &DatastoreConfig) -> Result<Self, AgentError> {
        let endpoint = format!("{}/sql", config.base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&endpoint).map_err(|err| {
            AgentError::Configuration(format!(
                "invalid provider base_url '{}': {err}",
                config.base_url
            ))
        })?;

        let timeout = config.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cms-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                AgentError::Configuration(format!(
                    "failed to build HTTP client: {err}"
                ))
            })?;

        Ok(Self {
            http,
            endpoint,
            auth: config.auth.clone(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn execute(
        &self,
        query: &DatasetQuery,
    ) -> Result<reqwest::Response, FetchError> {
        let sql = query.to_sql();
        debug!(endpoint = %self.endpoint, query = %sql, "querying datastore");

        let request = self
            .http
            .get(self.endpoint.clone())
            .query(&[("query", sql.as_str()), ("show_db_columns", "")]);
        let request = match &self.auth {
            ProviderAuth::None => request,
            ProviderAuth::Bearer { token } => request.bearer_auth(token),
            ProviderAuth::ApiKey { header, key } => {
                request.header(header.as_str(), key.as_str())
            }
            ProviderAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        };

        let response =
            request.send().await.map_err(|err| self.classify(err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        Ok(response)
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl FetchClient for DatastoreClient {
    async fn probe_count(
        &self,
        query: &DatasetQuery,
    ) -> Result<u64, FetchError> {
        let response = self.execute(query).await?;
        let body: Value =
            response.json().await.map_err(|err| self.classify(err))?;
        parse_count(&body)
    }

    async fn fetch_all(
        &self,
        query: &DatasetQuery,
    ) -> Result<Payload, FetchError> {
        let response = self.execute(query).await?;
        let bytes = response.bytes().await.map_err(|err| self.classify(err))?;
        Ok(Payload::new(bytes.to_vec()))
    }
}

/// Count responses look like `[{"expression": "12068"}]`; the value may also
/// arrive as a bare number or under the column alias.
fn parse_count(body: &Value) -> Result<u64, FetchError> {
    let row = body
        .as_array()
        .and_then(|rows| rows.first())
        .and_then(Value::as_object)
        .ok_or_else(|| {
            FetchError::Decode("count response has no result row".into())
        })?;

    let value = row
        .get("expression")
        .or_else(|| row.get("COUNT(*)"))
        .or_else(|| row.values().next())
        .ok_or_else(|| FetchError::Decode("count row is empty".into()))?;

    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        FetchError::Decode(format!("count value {value} is not an integer"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{
        Json, Router,
        extract::Query,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/datastore")
    }

    fn client_for(base_url: String, auth: ProviderAuth) -> DatastoreClient {
        DatastoreClient::new(&DatastoreConfig {
            base_url,
            dataset_id: "ds-1".into(),
            request_timeout_ms: 5_000,
            auth,
        })
        .unwrap()
    }

    #[test]
    fn parses_count_shapes() {
        assert_eq!(parse_count(&json!([{"expression": "12068"}])).unwrap(), 12068);
        assert_eq!(parse_count(&json!([{"expression": 42}])).unwrap(), 42);
        assert_eq!(parse_count(&json!([{"COUNT(*)": "7"}])).unwrap(), 7);
        assert!(parse_count(&json!([])).is_err());
        assert!(parse_count(&json!([{"expression": "many"}])).is_err());
        assert!(parse_count(&json!({"expression": 1})).is_err());
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = DatastoreClient::new(&DatastoreConfig {
            base_url: "not a url".into(),
            ..DatastoreConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[tokio::test]
    async fn probe_sends_sql_and_auth() {
        let router = Router::new().route(
            "/datastore/sql",
            get(
                |Query(params): Query<HashMap<String, String>>,
                 headers: HeaderMap| async move {
                    assert_eq!(
                        params.get("query").map(String::as_str),
                        Some("[SELECT COUNT(*) FROM ds-1]")
                    );
                    assert!(params.contains_key("show_db_columns"));
                    assert_eq!(
                        headers.get("authorization").unwrap(),
                        "Bearer secret"
                    );
                    Json(json!([{"expression": "12100"}]))
                },
            ),
        );
        let base = serve(router).await;
        let client = client_for(
            base,
            ProviderAuth::Bearer {
                token: "secret".into(),
            },
        );

        let count = client
            .probe_count(&DatasetQuery::count("ds-1"))
            .await
            .unwrap();
        assert_eq!(count, 12100);
    }

    #[tokio::test]
    async fn fetch_all_returns_raw_body() {
        let router = Router::new().route(
            "/datastore/sql",
            get(|| async { Json(json!([{"a": "1"}, {"a": "2"}])) }),
        );
        let client = client_for(serve(router).await, ProviderAuth::None);

        let payload =
            client.fetch_all(&DatasetQuery::all("ds-1")).await.unwrap();
        let parsed: Value = serde_json::from_slice(payload.as_bytes()).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_are_not() {
        let router = Router::new()
            .route(
                "/flaky/sql",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
            )
            .route(
                "/missing/sql",
                get(|| async { (StatusCode::NOT_FOUND, "no such dataset") }),
            );
        let base = serve(router).await;
        let root = base.trim_end_matches("/datastore").to_string();

        let flaky = client_for(format!("{root}/flaky"), ProviderAuth::None);
        let err = flaky
            .fetch_all(&DatasetQuery::all("ds-1"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let missing =
            client_for(format!("{root}/missing"), ProviderAuth::None);
        let err = missing
            .probe_count(&DatasetQuery::count("ds-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            client_for(format!("http://{addr}/datastore"), ProviderAuth::None);
        let err = client
            .probe_count(&DatasetQuery::count("ds-1"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
