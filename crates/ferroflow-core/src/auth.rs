use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{ConnectorError, ErrorContext};
use crate::http_client::{append_query, HttpAuth, HttpClient, HttpRequest};

/// Produces the credential attached to every upstream request.
///
/// `invalidate` is called after a 401; the next `credential` call must
/// obtain a fresh value rather than serving a cached one.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<HttpAuth, ConnectorError>;

    async fn invalidate(&self);
}

/// Fixed credential (personal access token, basic auth, or none).
#[derive(Debug, Clone)]
pub struct StaticCredential {
    auth: HttpAuth,
}

impl StaticCredential {
    pub fn new(auth: HttpAuth) -> Self {
        Self { auth }
    }

    pub fn anonymous() -> Self {
        Self::new(HttpAuth::None)
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(HttpAuth::BearerToken(token.into()))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> Result<HttpAuth, ConnectorError> {
        Ok(self.auth.clone())
    }

    async fn invalidate(&self) {}
}

/// OAuth2 grant used to mint bearer tokens.
#[derive(Clone)]
pub enum TokenGrant {
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    ClientCredentials {
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Bearer token obtained from an OAuth2 token endpoint and cached until
/// `expires_in` minus a safety buffer.
pub struct OAuthTokenCredential {
    http_client: Arc<dyn HttpClient>,
    token_url: String,
    grant: TokenGrant,
    expiry_buffer: Duration,
    timeout_ms: u64,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthTokenCredential {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        token_url: impl Into<String>,
        grant: TokenGrant,
    ) -> Self {
        let expiry_buffer = match grant {
            TokenGrant::RefreshToken { .. } => Duration::from_secs(60),
            TokenGrant::ClientCredentials { .. } => Duration::from_secs(300),
        };
        Self {
            http_client,
            token_url: token_url.into(),
            grant,
            expiry_buffer,
            timeout_ms: 30_000,
            cached: Mutex::new(None),
        }
    }

    pub fn with_expiry_buffer(mut self, expiry_buffer: Duration) -> Self {
        self.expiry_buffer = expiry_buffer;
        self
    }

    fn token_request(&self) -> HttpRequest {
        let request = HttpRequest::post(&self.token_url)
            .with_header("content-type", "application/x-www-form-urlencoded")
            .with_header("accept", "application/json")
            .with_timeout_ms(self.timeout_ms);

        match &self.grant {
            TokenGrant::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
            } => request.with_body(form_body([
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])),
            TokenGrant::ClientCredentials {
                client_id,
                client_secret,
                scope,
            } => {
                let mut form = vec![("grant_type", "client_credentials")];
                if let Some(scope) = scope {
                    form.push(("scope", scope.as_str()));
                }
                request
                    .with_auth(&HttpAuth::Basic {
                        username: client_id.clone(),
                        password: client_secret.clone(),
                    })
                    .with_body(form_body(form))
            }
        }
    }

    async fn fetch_token(&self) -> Result<CachedToken, ConnectorError> {
        let context = ErrorContext::endpoint(&self.token_url);
        let response = self
            .http_client
            .execute(self.token_request())
            .await
            .map_err(|e| ConnectorError::transient(context.clone(), e.message()))?;

        if !response.is_success() {
            return Err(ConnectorError::fatal(
                context.with_status(response.status).with_body(&response.body),
                "token endpoint rejected the credential grant",
            ));
        }

        let payload: TokenResponse =
            serde_json::from_str(&response.body).map_err(|source| ConnectorError::Decode {
                context: context.clone(),
                source,
            })?;
        let token = payload.access_token.ok_or_else(|| {
            ConnectorError::protocol(context, "object with access_token", "object without access_token")
        })?;
        let lifetime = Duration::from_secs(payload.expires_in.unwrap_or(3_600));

        tracing::debug!(token_url = %self.token_url, expires_in = lifetime.as_secs(), "obtained access token");

        Ok(CachedToken {
            token,
            refresh_at: Instant::now() + lifetime.saturating_sub(self.expiry_buffer),
        })
    }
}

#[async_trait]
impl CredentialProvider for OAuthTokenCredential {
    async fn credential(&self) -> Result<HttpAuth, ConnectorError> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if Instant::now() < current.refresh_at {
                return Ok(HttpAuth::BearerToken(current.token.clone()));
            }
        }

        let fresh = self.fetch_token().await?;
        let auth = HttpAuth::BearerToken(fresh.token.clone());
        *cached = Some(fresh);
        Ok(auth)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

fn form_body<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    append_query("", pairs).trim_start_matches('?').to_owned()
}
