//! Authenticated request execution shared by every connector.
//!
//! | Response | Handling |
//! |----------|----------|
//! | 2xx | returned |
//! | 401 | credential invalidated and request retried once; a second 401 is fatal |
//! | 429, 408, 5xx, rate-limited 403 | retried within the budget, waiting for the server hint or `base * 2^attempt` |
//! | 403/404 on an optional resource | empty result |
//! | anything else | fatal, with endpoint, status and truncated body |

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::auth::CredentialProvider;
use crate::config::HttpSettings;
use crate::error::{ConnectorError, ErrorContext};
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::retry::{ResetHeader, RetryConfig};
use crate::throttle::Throttle;

/// Whether a resource must exist for the read to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// 403/404 propagate as fatal errors.
    Required,
    /// 403/404 yield `None` (permission-gated or advisory sub-resources).
    Optional,
}

/// HTTP access layer bound to one upstream API.
#[derive(Clone)]
pub struct ApiClient {
    http_client: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialProvider>,
    base_url: String,
    retry: RetryConfig,
    timeout_ms: u64,
    throttle: Option<Throttle>,
    default_headers: BTreeMap<String, String>,
}

impl ApiClient {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialProvider>,
        base_url: impl Into<String>,
    ) -> Self {
        let mut default_headers = BTreeMap::new();
        default_headers.insert(String::from("accept"), String::from("application/json"));
        Self {
            http_client,
            credentials,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            retry: RetryConfig::default(),
            timeout_ms: 30_000,
            throttle: None,
            default_headers,
        }
    }

    pub fn with_settings(mut self, settings: &HttpSettings) -> Self {
        let reset_header = self.retry.reset_header.take();
        self.retry = RetryConfig {
            reset_header,
            ..settings.retry_config()
        };
        self.timeout_ms = settings.timeout_ms;
        self.throttle = settings.throttle();
        if let Some(user_agent) = &settings.user_agent {
            self.default_headers
                .insert(String::from("user-agent"), user_agent.clone());
        }
        self
    }

    pub fn with_reset_header(mut self, header: ResetHeader) -> Self {
        self.retry.reset_header = Some(header);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.default_headers
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves a path against the base URL; absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        requirement: Requirement,
    ) -> Result<Option<HttpResponse>, ConnectorError> {
        let request = HttpRequest::get(self.url(path)).with_query(query.iter().map(|(k, v)| (*k, v)));
        self.send(request, requirement).await
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        requirement: Requirement,
    ) -> Result<Option<Value>, ConnectorError> {
        let url = self.url(path);
        match self.get(path, query, requirement).await? {
            Some(response) => decode_json(&url, &response).map(Some),
            None => Ok(None),
        }
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        requirement: Requirement,
    ) -> Result<Option<Value>, ConnectorError> {
        let url = self.url(path);
        let request = HttpRequest::post(&url).with_json_body(body);
        match self.send(request, requirement).await? {
            Some(response) => decode_json(&url, &response).map(Some),
            None => Ok(None),
        }
    }

    /// Executes `request` with authentication, refresh-on-401 and retries.
    pub async fn send(
        &self,
        request: HttpRequest,
        requirement: Requirement,
    ) -> Result<Option<HttpResponse>, ConnectorError> {
        let endpoint = request.url.clone();
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            if let Some(throttle) = &self.throttle {
                throttle.acquire().await;
            }
            let auth = self.credentials.credential().await?;
            let mut outgoing = request.clone().with_auth(&auth).with_timeout_ms(self.timeout_ms);
            for (name, value) in &self.default_headers {
                outgoing
                    .headers
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }

            tracing::debug!(
                method = request.method.as_str(),
                endpoint = %endpoint,
                attempt,
                "sending request"
            );

            let response = match self.http_client.execute(outgoing).await {
                Ok(response) => response,
                Err(error) => {
                    let context = ErrorContext::endpoint(&endpoint);
                    if !(error.retryable() && self.retry.retry_on_transport) {
                        return Err(ConnectorError::fatal(context, error.message()));
                    }
                    if !self.retry.has_budget(attempt) {
                        return Err(ConnectorError::fatal(
                            context,
                            format!(
                                "retry budget exhausted after {} attempts: {}",
                                attempt + 1,
                                error.message()
                            ),
                        ));
                    }
                    let delay = self.retry.backoff_delay(attempt);
                    tracing::warn!(endpoint = %endpoint, attempt, delay_ms = delay.as_millis() as u64, error = %error, "transport failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            tracing::debug!(endpoint = %endpoint, status = response.status, "received response");

            if response.is_success() {
                return Ok(Some(response));
            }

            let status = response.status;
            let context = || {
                ErrorContext::endpoint(&endpoint)
                    .with_status(status)
                    .with_body(&response.body)
            };

            if status == 401 {
                if refreshed {
                    return Err(ConnectorError::fatal(
                        context(),
                        "authentication failed after credential refresh",
                    ));
                }
                tracing::warn!(endpoint = %endpoint, "received 401, refreshing credentials");
                self.credentials.invalidate().await;
                refreshed = true;
                continue;
            }

            if self.retry.is_retryable_response(&response) {
                if !self.retry.has_budget(attempt) {
                    return Err(ConnectorError::fatal(
                        context(),
                        format!("retry budget exhausted after {} attempts", attempt + 1),
                    ));
                }
                let delay = self.retry.delay_for_response(&response, attempt);
                tracing::warn!(
                    endpoint = %endpoint,
                    status,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retryable status, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if matches!(status, 403 | 404) && requirement == Requirement::Optional {
                tracing::debug!(endpoint = %endpoint, status, "optional resource unavailable, skipping");
                return Ok(None);
            }

            return Err(ConnectorError::fatal(
                context(),
                format!("upstream returned status {status}"),
            ));
        }
    }
}

pub(crate) fn decode_json(endpoint: &str, response: &HttpResponse) -> Result<Value, ConnectorError> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&response.body).map_err(|source| ConnectorError::Decode {
        context: ErrorContext::endpoint(endpoint)
            .with_status(response.status)
            .with_body(&response.body),
        source,
    })
}

/// Items of a JSON array, or a protocol violation naming the actual shape.
pub fn expect_array(endpoint: &str, value: Value) -> Result<Vec<Value>, ConnectorError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(ConnectorError::protocol(
            ErrorContext::endpoint(endpoint),
            "array",
            crate::error::json_shape(&other),
        )),
    }
}

/// Items under `key` of a JSON object; a missing key or null means no items.
pub fn expect_items(endpoint: &str, value: &Value, key: &str) -> Result<Vec<Value>, ConnectorError> {
    match value {
        Value::Object(map) => match map.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(other) => Err(ConnectorError::protocol(
                ErrorContext::endpoint(endpoint),
                format!("array under '{key}'"),
                crate::error::json_shape(other),
            )),
        },
        other => Err(ConnectorError::protocol(
            ErrorContext::endpoint(endpoint),
            "object",
            crate::error::json_shape(other),
        )),
    }
}
