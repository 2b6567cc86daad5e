//! Wire-level request and response envelopes plus the injectable transport.
//!
//! Connectors never touch reqwest directly: they build an [`HttpRequest`],
//! hand it to an [`HttpClient`], and inspect the [`HttpResponse`]. Tests swap
//! in a scripted client behind the same trait.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential attached to an outgoing request.
#[derive(Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(String),
    Basic { username: String, password: String },
    /// Arbitrary header, e.g. an API key.
    Header { name: String, value: String },
}

impl HttpAuth {
    /// The header this credential contributes, if any.
    fn header(&self) -> Option<(String, String)> {
        let authorization = |value: String| Some((String::from("authorization"), value));
        match self {
            Self::None => None,
            Self::BearerToken(token) => authorization(format!("Bearer {token}")),
            Self::Basic { username, password } => {
                authorization(format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))))
            }
            Self::Header { name, value } => Some((name.to_ascii_lowercase(), value.clone())),
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some((name, value)) = self.header() {
            headers.insert(name, value);
        }
    }
}

impl fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = match self {
            Self::None => return f.write_str("None"),
            Self::BearerToken(_) => String::from("bearer"),
            Self::Basic { username, .. } => format!("basic {username}"),
            Self::Header { name, .. } => format!("header {name}"),
        };
        write!(f, "HttpAuth({redacted}, <redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Lowercased names.
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// Adds encoded query pairs after any the URL already carries.
    pub fn with_query<K, V>(self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let url = append_query(&self.url, params);
        Self { url, ..self }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        insert_header(&mut self.headers, name.into(), value.into());
        self
    }

    pub fn with_body(self, body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..self
        }
    }

    pub fn with_json_body(self, body: &serde_json::Value) -> Self {
        self.with_body(body.to_string())
            .with_header("content-type", "application/json")
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        auth.apply(&mut self.headers);
        self
    }

    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        Self { timeout_ms, ..self }
    }
}

fn insert_header(headers: &mut HeaderMap, name: String, value: String) {
    headers.insert(name.to_ascii_lowercase(), value);
}

/// Appends `key=value` pairs to `url`, percent-encoding both sides.
///
/// An empty `url` yields `?a=b`, which the form encoder strips.
pub fn append_query<K, V>(url: &str, params: impl IntoIterator<Item = (K, V)>) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = String::from(url);
    let mut separator = if url.contains('?') { '&' } else { '?' };
    for (key, value) in params {
        out.push(separator);
        out.push_str(&urlencoding::encode(key.as_ref()));
        out.push('=');
        out.push_str(&urlencoding::encode(value.as_ref()));
        separator = '&';
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Lowercased names.
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 200 with the given JSON text.
    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        insert_header(&mut self.headers, name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let key = name.to_ascii_lowercase();
        self.headers.get(&key).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    message: String,
    retryable: bool,
}

impl HttpError {
    /// A failure worth retrying (timeouts, resets).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }
}

pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

/// Executes one request. Implementations do not retry; that is the
/// caller's policy.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a>;
}

/// [`HttpClient`] over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    inner: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::with_user_agent(concat!("ferroflow/", env!("CARGO_PKG_VERSION")))
    }

    pub fn with_user_agent(user_agent: &str) -> Self {
        let built = reqwest::Client::builder().user_agent(user_agent).build();
        match built {
            Ok(client) => Self::with_client(client),
            Err(error) => {
                tracing::warn!(%error, "falling back to the default reqwest client");
                Self::with_client(reqwest::Client::new())
            }
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    fn prepare(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let builder = request.headers.iter().fold(
            self.inner.request(method, &request.url),
            |builder, (name, value)| builder.header(name, value),
        );
        let builder = builder.timeout(Duration::from_millis(request.timeout_ms));
        match request.body {
            Some(body) => builder.body(body),
            None => builder,
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_error(error: reqwest::Error) -> HttpError {
    if error.is_builder() {
        return HttpError::non_retryable(format!("malformed request: {error}"));
    }
    let kind = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "could not connect"
    } else {
        "transport failure"
    };
    HttpError::new(format!("{kind}: {error}"))
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        let builder = self.prepare(request);
        Box::pin(async move {
            let response = builder.send().await.map_err(transport_error)?;
            let status = response.status().as_u16();
            let mut headers = HeaderMap::new();
            for (name, value) in response.headers() {
                if let Ok(value) = value.to_str() {
                    insert_header(&mut headers, name.as_str().to_owned(), value.to_owned());
                }
            }
            let body = response
                .text()
                .await
                .map_err(|error| HttpError::new(format!("reading body: {error}")))?;
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_become_authorization_headers() {
        let bearer = HttpRequest::get("https://api.test/user")
            .with_auth(&HttpAuth::BearerToken(String::from("tok")));
        let basic = HttpRequest::get("https://pi.test/piwebapi").with_auth(&HttpAuth::Basic {
            username: String::from("pi"),
            password: String::from("secret"),
        });

        assert_eq!(bearer.headers["authorization"], "Bearer tok");
        assert_eq!(basic.headers["authorization"], "Basic cGk6c2VjcmV0");
    }

    #[test]
    fn custom_header_credential_is_lowercased() {
        let request = HttpRequest::get("https://api.test").with_auth(&HttpAuth::Header {
            name: String::from("X-Api-Key"),
            value: String::from("k"),
        });

        assert_eq!(request.headers.get("x-api-key").map(String::as_str), Some("k"));
        assert!(!request.headers.contains_key("authorization"));
    }

    #[test]
    fn redacted_debug_never_prints_secrets() {
        let cases = [
            HttpAuth::BearerToken(String::from("s3cr3t")),
            HttpAuth::Basic {
                username: String::from("pi"),
                password: String::from("s3cr3t"),
            },
            HttpAuth::Header {
                name: String::from("x-key"),
                value: String::from("s3cr3t"),
            },
        ];

        for auth in cases {
            assert!(!format!("{auth:?}").contains("s3cr3t"), "{auth:?}");
        }
    }

    #[test]
    fn query_pairs_extend_an_existing_query() {
        let request = HttpRequest::get("https://gmail.test/history?userId=me")
            .with_query([("q", "from:a b"), ("maxResults", "100")]);

        assert_eq!(
            request.url,
            "https://gmail.test/history?userId=me&q=from%3Aa%20b&maxResults=100"
        );
        assert_eq!(append_query("https://a.test/x", Vec::<(&str, &str)>::new()), "https://a.test/x");
    }

    #[test]
    fn json_body_sets_content_type() {
        let request = HttpRequest::post("https://ga.test/run").with_json_body(&serde_json::json!({ "limit": 1 }));

        assert_eq!(request.body.as_deref(), Some(r#"{"limit":1}"#));
        assert_eq!(request.headers["content-type"], "application/json");
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let response = HttpResponse::ok_json("[]").with_header("Retry-After", "7");

        assert_eq!(response.header("RETRY-AFTER"), Some("7"));
        assert!(response.is_success());
        assert!(!HttpResponse::new(304, "").is_success());
    }
}
