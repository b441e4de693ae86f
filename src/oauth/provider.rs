//! OAuth provider configurations.
//!
//! Endpoints, scopes and client credentials for each integrated service.

use crate::credentials::Provider;
use std::fmt;

/// Google endpoints used by the default `google_meet` provider.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
pub const GOOGLE_MEET_SCOPES: &[&str] = &["https://www.googleapis.com/auth/calendar.events"];

/// OAuth provider configuration
#[derive(Clone)]
pub struct ProviderConfig {
    pub provider: Provider,

    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token endpoint URL (code exchange and refresh)
    pub token_url: String,

    /// OAuth revocation endpoint URL
    pub revoke_url: String,

    /// Scopes requested on every authorization
    pub scopes: Vec<String>,

    /// Redirect URI registered with the provider
    pub redirect_uri: String,

    pub client_id: String,

    pub client_secret: String,
}

impl ProviderConfig {
    /// Build authorization URL for the given state token.
    ///
    /// Always asks for offline access with forced consent so the provider
    /// issues a refresh token, even when the user has consented before.
    pub fn build_auth_url(&self, state: &str) -> String {
        let scopes = self.scopes.join(" ");
        let separator = if self.auth_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            self.auth_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }

    /// Scopes joined the way providers report them.
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("revoke_url", &self.revoke_url)
            .field("scopes", &self.scopes)
            .field("redirect_uri", &self.redirect_uri)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            provider: Provider::new("google_meet").unwrap(),
            auth_url: "https://example.com/oauth/authorize".to_string(),
            token_url: "https://example.com/oauth/token".to_string(),
            revoke_url: "https://example.com/oauth/revoke".to_string(),
            scopes: vec!["read".to_string(), "write".to_string()],
            redirect_uri: "http://localhost:3000/callback".to_string(),
            client_id: "test_client_id".to_string(),
            client_secret: "test_secret".to_string(),
        }
    }

    #[test]
    fn test_build_auth_url() {
        let url = test_config().build_auth_url("random_state");

        assert!(url.starts_with("https://example.com/oauth/authorize?"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcallback"));
        // URL encoding converts spaces to %20
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("state=random_state"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(!url.contains("test_secret"));
    }

    #[test]
    fn test_build_auth_url_with_existing_query() {
        let config = ProviderConfig {
            auth_url: "https://example.com/authorize?hd=school.example".to_string(),
            ..test_config()
        };

        let url = config.build_auth_url("s");
        assert!(url.starts_with("https://example.com/authorize?hd=school.example&client_id="));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", test_config());
        assert!(!debug.contains("test_secret"));
        assert!(debug.contains("test_client_id"));
    }
}
