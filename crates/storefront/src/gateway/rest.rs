//! HTTP gateway for the hosted backend.
//!
//! Rows go through the `PostgREST` endpoint (`/rest/v1/<table>`), stored
//! procedures through `/rest/v1/rpc/<name>`, and password sign-in through the
//! auth endpoint (`/auth/v1/token`). Realtime channels are delegated to
//! [`RealtimeClient`].

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};
use urban_threads_core::UserId;

use super::{
    ChannelScope, Gateway, GatewayError, Mutation, MutationKind, RealtimeClient, RowQuery,
    Subscription,
};
use crate::config::SupabaseConfig;

/// Tokens issued by the auth endpoint for a signed-in user.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: DateTime<Utc>,
    pub user_id: UserId,
    pub email: Option<String>,
}

impl AuthTokens {
    /// Whether the access token is past (or within `margin` of) expiry.
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
    email: Option<String>,
}

impl From<TokenResponse> for AuthTokens {
    fn from(token: TokenResponse) -> Self {
        Self {
            access_token: SecretString::from(token.access_token),
            refresh_token: SecretString::from(token.refresh_token),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
            user_id: UserId::new(token.user.id),
            email: token.user.email,
        }
    }
}

/// Error body shape shared by the row, procedure and auth endpoints.
#[derive(Deserialize, Default)]
struct ErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    hint: Option<String>,
}

impl ErrorBody {
    fn summary(self, raw: &str) -> String {
        let mut message = self
            .message
            .or(self.msg)
            .or(self.error_description)
            .unwrap_or_else(|| raw.chars().take(200).collect());
        if let Some(hint) = self.hint {
            message.push_str(" (");
            message.push_str(&hint);
            message.push(')');
        }
        message
    }
}

// =============================================================================
// SupabaseClient
// =============================================================================

/// Client for the hosted backend's HTTP endpoints.
///
/// Cheaply cloneable. Requests carry the signed-in user's access token when
/// one is set, otherwise the anonymous key.
#[derive(Clone)]
pub struct SupabaseClient {
    inner: Arc<SupabaseClientInner>,
}

struct SupabaseClientInner {
    client: reqwest::Client,
    rest_endpoint: String,
    auth_endpoint: String,
    anon_key: SecretString,
    session: RwLock<Option<AuthTokens>>,
    realtime: RealtimeClient,
}

impl SupabaseClient {
    /// Create a new client.
    #[must_use]
    pub fn new(config: &SupabaseConfig) -> Self {
        let base = config.url.as_str().trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            inner: Arc::new(SupabaseClientInner {
                client,
                rest_endpoint: format!("{base}/rest/v1"),
                auth_endpoint: format!("{base}/auth/v1"),
                anon_key: config.anon_key.clone(),
                session: RwLock::new(None),
                realtime: RealtimeClient::new(config),
            }),
        }
    }

    /// Attach (or clear) the user session used for row-level security.
    pub fn set_session(&self, tokens: Option<&AuthTokens>) {
        if let Ok(mut guard) = self.inner.session.write() {
            *guard = tokens.cloned();
        }
    }

    /// Tokens of the attached session, if any.
    #[must_use]
    pub fn session(&self) -> Option<AuthTokens> {
        self.inner.session.read().ok().and_then(|guard| guard.clone())
    }

    fn bearer(&self) -> SecretString {
        self.session()
            .map_or_else(|| self.inner.anon_key.clone(), |tokens| tokens.access_token)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.inner
            .client
            .request(method, url)
            .header("apikey", self.inner.anon_key.expose_secret())
            .bearer_auth(self.bearer().expose_secret())
    }

    /// Send a request and return the raw body of a successful response.
    async fn execute(&self, request: RequestBuilder) -> Result<String, GatewayError> {
        let response = request.send().await?;
        let status = response.status();

        // Check for rate limiting
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(GatewayError::RateLimited(retry_after));
        }

        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }

        let message = serde_json::from_str::<ErrorBody>(&body)
            .unwrap_or_default()
            .summary(&body);

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(status = %status, "Backend rejected session token");
            return Err(GatewayError::Unauthorized(message));
        }

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                body = %body.chars().take(500).collect::<String>(),
                "Backend returned server error"
            );
        } else {
            debug!(status = %status, message = %message, "Backend rejected request");
        }

        Err(GatewayError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn parse_rows(body: &str) -> Result<Vec<Value>, GatewayError> {
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(body)? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            row => Ok(vec![row]),
        }
    }

    // =========================================================================
    // Auth Methods
    // =========================================================================

    /// Sign in with email and password.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Status`] or [`GatewayError::Unauthorized`] if
    /// the credentials are rejected.
    #[instrument(skip(self, password))]
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<AuthTokens, GatewayError> {
        let url = format!("{}/token?grant_type=password", self.inner.auth_endpoint);
        let request = self
            .inner
            .client
            .post(url)
            .header("apikey", self.inner.anon_key.expose_secret())
            .json(&serde_json::json!({
                "email": email,
                "password": password.expose_secret(),
            }));

        let body = self.execute(request).await?;
        let tokens = AuthTokens::from(serde_json::from_str::<TokenResponse>(&body)?);
        self.set_session(Some(&tokens));
        Ok(tokens)
    }

    /// Exchange a refresh token for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthorized`] if the refresh token is no
    /// longer valid.
    #[instrument(skip_all)]
    pub async fn refresh_session(&self, tokens: &AuthTokens) -> Result<AuthTokens, GatewayError> {
        let url = format!(
            "{}/token?grant_type=refresh_token",
            self.inner.auth_endpoint
        );
        let request = self
            .inner
            .client
            .post(url)
            .header("apikey", self.inner.anon_key.expose_secret())
            .json(&serde_json::json!({
                "refresh_token": tokens.refresh_token.expose_secret(),
            }));

        let body = self.execute(request).await?;
        let tokens = AuthTokens::from(serde_json::from_str::<TokenResponse>(&body)?);
        self.set_session(Some(&tokens));
        Ok(tokens)
    }

    /// Revoke the current session and fall back to anonymous access.
    ///
    /// # Errors
    ///
    /// Returns an error if the logout request fails. The local session is
    /// cleared either way.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<(), GatewayError> {
        let url = format!("{}/logout", self.inner.auth_endpoint);
        let result = self.execute(self.request(Method::POST, &url)).await;
        self.set_session(None);
        result.map(|_| ())
    }
}

impl Gateway for SupabaseClient {
    #[instrument(skip(self, query), fields(table = %query.table))]
    async fn query(&self, query: &RowQuery) -> Result<Vec<Value>, GatewayError> {
        let url = format!("{}/{}", self.inner.rest_endpoint, query.table);
        let request = self.request(Method::GET, &url).query(&query.to_params());
        let body = self.execute(request).await?;
        Self::parse_rows(&body)
    }

    #[instrument(skip(self, mutation), fields(table = %mutation.table, kind = ?mutation.kind))]
    async fn mutate(&self, mutation: &Mutation) -> Result<Vec<Value>, GatewayError> {
        let url = format!("{}/{}", self.inner.rest_endpoint, mutation.table);
        let method = match mutation.kind {
            MutationKind::Insert => Method::POST,
            MutationKind::Update => Method::PATCH,
            MutationKind::Delete => Method::DELETE,
        };

        let mut request = self
            .request(method, &url)
            .header("Prefer", "return=representation")
            .query(&mutation.to_params());
        if !mutation.payload.is_null() {
            request = request.json(&mutation.payload);
        }

        let body = self.execute(request).await?;
        Self::parse_rows(&body)
    }

    #[instrument(skip(self, args))]
    async fn call_procedure(&self, name: &str, args: Value) -> Result<Value, GatewayError> {
        let url = format!("{}/rpc/{name}", self.inner.rest_endpoint);
        let request = self.request(Method::POST, &url).json(&args);

        match self.execute(request).await {
            Ok(body) if body.trim().is_empty() => Ok(Value::Null),
            Ok(body) => Ok(serde_json::from_str(&body)?),
            Err(GatewayError::Status { message, .. }) => Err(GatewayError::Procedure {
                name: name.to_owned(),
                message,
            }),
            Err(e) => Err(e),
        }
    }

    async fn subscribe(&self, scope: &ChannelScope) -> Result<Subscription, GatewayError> {
        self.inner.realtime.subscribe(scope, &self.bearer()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_summary_prefers_message() {
        let body = r#"{"message":"new row violates check constraint","hint":"quantity > 0"}"#;
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        assert_eq!(
            parsed.summary(body),
            "new row violates check constraint (quantity > 0)"
        );
    }

    #[test]
    fn test_error_body_summary_falls_back_to_raw() {
        let parsed = ErrorBody::default();
        assert_eq!(parsed.summary("upstream timeout"), "upstream timeout");
    }

    #[test]
    fn test_parse_rows_shapes() {
        assert_eq!(SupabaseClient::parse_rows("").ok(), Some(vec![]));
        assert_eq!(SupabaseClient::parse_rows("null").ok(), Some(vec![]));
        assert_eq!(
            SupabaseClient::parse_rows(r#"[{"id":"a"},{"id":"b"}]"#)
                .map(|rows| rows.len())
                .ok(),
            Some(2)
        );
        assert_eq!(
            SupabaseClient::parse_rows(r#"{"id":"a"}"#)
                .map(|rows| rows.len())
                .ok(),
            Some(1)
        );
    }

    #[test]
    fn test_tokens_expiry_margin() {
        let tokens = AuthTokens {
            access_token: SecretString::from("a"),
            refresh_token: SecretString::from("r"),
            expires_at: Utc::now() + Duration::seconds(30),
            user_id: UserId::new("u-1"),
            email: None,
        };
        assert!(tokens.expires_within(Duration::seconds(60)));
        assert!(!tokens.expires_within(Duration::seconds(5)));
    }
}
