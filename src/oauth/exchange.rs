//! HTTP calls to a provider's token and revocation endpoints.
//!
//! Responses are classified into [`ProviderFailure`] kinds; the callers decide
//! what each kind means for them (a rejected code vs. a revoked refresh token).

use super::provider::ProviderConfig;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error response body (RFC 6749 §5.2)
#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Longest `expires_in` accepted from a provider, in seconds.
const MAX_EXPIRES_IN: i64 = u32::MAX as i64;

/// Tokens issued by a successful code exchange or refresh.
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl TokenGrant {
    /// Absolute expiry of the access token issued at `now`.
    ///
    /// A missing, non-positive or out-of-range `expires_in` falls back to
    /// `default_lifetime`.
    pub fn expires_at(
        &self,
        now: DateTime<Utc>,
        default_lifetime: chrono::Duration,
    ) -> DateTime<Utc> {
        let lifetime = match self.expires_in {
            Some(secs) if (1..=MAX_EXPIRES_IN).contains(&secs) => chrono::Duration::seconds(secs),
            Some(secs) => {
                tracing::warn!(expires_in = secs, "Ignoring out-of-range expires_in from provider");
                default_lifetime
            }
            None => default_lifetime,
        };

        now.checked_add_signed(lifetime)
            .or_else(|| now.checked_add_signed(default_lifetime))
            .unwrap_or(now)
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Why a provider call did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    /// Request never completed (connect error, timeout)
    Network(String),
    /// 5xx or 429 from the provider
    Server(u16),
    /// Other 4xx, with the OAuth `error` code
    Rejected { status: u16, error_code: String },
    /// 2xx with a body that is not a token response
    Malformed(String),
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderFailure::Network(msg) => write!(f, "network error: {}", msg),
            ProviderFailure::Server(status) => write!(f, "provider returned status {}", status),
            ProviderFailure::Rejected { status, error_code } => {
                write!(f, "provider rejected request ({}): {}", status, error_code)
            }
            ProviderFailure::Malformed(msg) => write!(f, "malformed provider response: {}", msg),
        }
    }
}

/// Shared HTTP client for provider endpoints.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
}

impl ProviderClient {
    /// Every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { http })
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        config: &ProviderConfig,
        code: &str,
    ) -> Result<TokenGrant, ProviderFailure> {
        tracing::debug!(provider = %config.provider, "Exchanging authorization code for token");

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];
        self.request_tokens(config, &form).await
    }

    /// Obtain a new access token with a refresh token.
    pub async fn refresh(
        &self,
        config: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderFailure> {
        tracing::debug!(provider = %config.provider, "Refreshing access token");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];
        self.request_tokens(config, &form).await
    }

    /// Revoke a token at the provider.
    pub async fn revoke(&self, config: &ProviderConfig, token: &str) -> Result<(), ProviderFailure> {
        let form = [
            ("token", token),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];
        let response = self.post_form(&config.revoke_url, &form).await?;
        check_status(response).await.map(|_| ())
    }

    async fn request_tokens(
        &self,
        config: &ProviderConfig,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, ProviderFailure> {
        let response = self.post_form(&config.token_url, form).await?;
        let response = check_status(response).await?;

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Malformed(e.to_string()))?;

        tracing::debug!(
            provider = %config.provider,
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token request successful"
        );

        Ok(TokenGrant {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_in: token_response.expires_in,
            token_type: token_response.token_type,
            scope: token_response.scope,
        })
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<reqwest::Response, ProviderFailure> {
        self.http
            .post(url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderFailure::Network(e.without_url().to_string()))
    }
}

/// Passes 2xx responses through and classifies everything else.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        tracing::warn!(status = status.as_u16(), "Provider unavailable");
        return Err(ProviderFailure::Server(status.as_u16()));
    }

    let body = response.text().await.unwrap_or_default();
    let (error_code, description) = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => (err.error, err.error_description),
        Err(_) => ("unknown_error".to_string(), None),
    };

    // Provider wording stays in the logs; callers only see the code
    tracing::debug!(
        status = status.as_u16(),
        error_code = %error_code,
        description = ?description,
        "Provider rejected request"
    );

    Err(ProviderFailure::Rejected {
        status: status.as_u16(),
        error_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Provider;
    use mockito::{Matcher, Server};

    fn config_for(server_url: &str) -> ProviderConfig {
        ProviderConfig {
            provider: Provider::new("google_meet").unwrap(),
            auth_url: format!("{}/auth", server_url),
            token_url: format!("{}/token", server_url),
            revoke_url: format!("{}/revoke", server_url),
            scopes: vec!["calendar".to_string()],
            redirect_uri: "http://localhost:3000/callback".to_string(),
            client_id: "client-1".to_string(),
            client_secret: "secret-1".to_string(),
        }
    }

    fn client() -> ProviderClient {
        ProviderClient::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "ya29.access",
            "refresh_token": "1//refresh",
            "expires_in": 3599,
            "token_type": "Bearer",
            "scope": "https://www.googleapis.com/auth/calendar.events"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "ya29.access");
        assert_eq!(response.refresh_token, Some("1//refresh".to_string()));
        assert_eq!(response.expires_in, Some(3599));
        assert_eq!(response.token_type, Some("Bearer".to_string()));
    }

    #[test]
    fn test_token_response_minimal() {
        let json = r#"{ "access_token": "token_12345" }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "token_12345");
        assert_eq!(response.refresh_token, None);
        assert_eq!(response.expires_in, None);
        assert_eq!(response.scope, None);
    }

    #[test]
    fn test_grant_debug_redacts_tokens() {
        let grant = TokenGrant {
            access_token: "AT1".to_string(),
            refresh_token: Some("RT1".to_string()),
            expires_in: Some(3600),
            token_type: None,
            scope: None,
        };
        let debug = format!("{:?}", grant);
        assert!(!debug.contains("AT1"));
        assert!(!debug.contains("RT1"));
        assert!(debug.contains("has_refresh_token: true"));
    }

    fn grant_expiring_in(expires_in: Option<i64>) -> TokenGrant {
        TokenGrant {
            access_token: "AT1".to_string(),
            refresh_token: None,
            expires_in,
            token_type: None,
            scope: None,
        }
    }

    #[test]
    fn test_expires_at_uses_provider_lifetime() {
        let now = Utc::now();
        let default = chrono::Duration::seconds(3600);

        assert_eq!(
            grant_expiring_in(Some(120)).expires_at(now, default),
            now + chrono::Duration::seconds(120)
        );
        assert_eq!(grant_expiring_in(None).expires_at(now, default), now + default);
    }

    #[test]
    fn test_expires_at_rejects_out_of_range_lifetimes() {
        let now = Utc::now();
        let default = chrono::Duration::seconds(3600);

        for expires_in in [i64::MAX, 9_000_000_000_000, i64::MIN, -5, 0] {
            assert_eq!(
                grant_expiring_in(Some(expires_in)).expires_at(now, default),
                now + default,
                "expires_in = {}",
                expires_in
            );
        }
    }

    #[test]
    fn test_expires_at_accepts_longest_lifetime() {
        let now = Utc::now();
        let expires_at = grant_expiring_in(Some(MAX_EXPIRES_IN))
            .expires_at(now, chrono::Duration::seconds(3600));
        assert_eq!(expires_at, now + chrono::Duration::seconds(MAX_EXPIRES_IN));
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "code-abc".into()),
                Matcher::UrlEncoded(
                    "redirect_uri".into(),
                    "http://localhost:3000/callback".into(),
                ),
                Matcher::UrlEncoded("client_id".into(), "client-1".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"AT1","refresh_token":"RT1","expires_in":3600}"#)
            .create_async()
            .await;

        let grant = client()
            .exchange_code(&config_for(&server.url()), "code-abc")
            .await
            .unwrap();

        assert_eq!(grant.access_token, "AT1");
        assert_eq!(grant.refresh_token.as_deref(), Some("RT1"));
        assert_eq!(grant.expires_in, Some(3600));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_sends_refresh_grant() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "RT1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"AT2","expires_in":3600}"#)
            .create_async()
            .await;

        let grant = client()
            .refresh(&config_for(&server.url()), "RT1")
            .await
            .unwrap();

        assert_eq!(grant.access_token, "AT2");
        assert!(grant.refresh_token.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_carries_error_code() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Bad Request"}"#)
            .create_async()
            .await;

        let result = client()
            .exchange_code(&config_for(&server.url()), "used-code")
            .await;

        assert_eq!(
            result,
            Err(ProviderFailure::Rejected {
                status: 400,
                error_code: "invalid_grant".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_rejected_without_json_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(401)
            .with_body("Unauthorized")
            .create_async()
            .await;

        let result = client().refresh(&config_for(&server.url()), "RT1").await;

        assert_eq!(
            result,
            Err(ProviderFailure::Rejected {
                status: 401,
                error_code: "unknown_error".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_server_errors_and_rate_limits() {
        for status in [500, 503, 429] {
            let mut server = Server::new_async().await;
            let _mock = server
                .mock("POST", "/token")
                .with_status(status)
                .create_async()
                .await;

            let result = client().refresh(&config_for(&server.url()), "RT1").await;
            assert_eq!(result, Err(ProviderFailure::Server(status as u16)));
        }
    }

    #[tokio::test]
    async fn test_malformed_success_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"missing access_token"}"#)
            .create_async()
            .await;

        let result = client().refresh(&config_for(&server.url()), "RT1").await;
        assert!(matches!(result, Err(ProviderFailure::Malformed(_))));
    }

    #[tokio::test]
    async fn test_network_failure() {
        // Nothing listens on port 9
        let result = client()
            .refresh(&config_for("http://127.0.0.1:9"), "RT1")
            .await;
        assert!(matches!(result, Err(ProviderFailure::Network(_))));
    }

    #[tokio::test]
    async fn test_revoke() {
        let mut server = Server::new_async().await;
        let ok = server
            .mock("POST", "/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "RT1".into()))
            .with_status(200)
            .create_async()
            .await;
        let rejected = server
            .mock("POST", "/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "gone".into()))
            .with_status(400)
            .with_body(r#"{"error":"invalid_token"}"#)
            .create_async()
            .await;

        let config = config_for(&server.url());
        assert!(client().revoke(&config, "RT1").await.is_ok());
        assert_eq!(
            client().revoke(&config, "gone").await,
            Err(ProviderFailure::Rejected {
                status: 400,
                error_code: "invalid_token".to_string()
            })
        );

        ok.assert_async().await;
        rejected.assert_async().await;
    }
}
