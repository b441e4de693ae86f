//! OAuth 2.0 credential management for calendar/video integrations.
//!
//! Implements the authorization code flow with refresh:
//! 1. `build_authorization_url` issues a state token and returns the provider URL
//! 2. User consents on the provider's site
//! 3. Provider redirects back; `handle_callback` validates state, exchanges
//!    the code and stores encrypted credentials
//! 4. `get_access_token` hands out a valid access token, refreshing it
//!    (once per subject/provider) when it is about to expire
//! 5. `disconnect` revokes at the provider and deletes the credential

pub mod exchange;
pub mod provider;
pub mod refresher;
pub mod single_flight;
pub mod state_ledger;


pub use exchange::{ProviderClient, ProviderFailure, TokenGrant};
pub use provider::ProviderConfig;
pub use refresher::TokenRefresher;
pub use single_flight::SingleFlight;
pub use state_ledger::{run_state_cleanup, StateLedger, ValidatedState};

use crate::config::OAuthSettings;
use crate::credentials::{Credential, CredentialStore, Provider, SubjectId};
use crate::error::{OAuthError, Result};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A completed authorization flow.
#[derive(Clone, Debug, PartialEq)]
pub struct Connected {
    pub subject: SubjectId,
    pub provider: Provider,
}

/// Outcome of a disconnect. Every variant is a success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disconnected {
    /// Provider revoked the grant and the local credential was deleted
    Revoked,
    /// Local credential deleted; remote revocation failed or was skipped
    LocalOnly,
    /// Nothing was stored
    AlreadyDisconnected,
}

/// Entry point used by the rest of the platform.
pub struct OAuthService {
    store: Arc<CredentialStore>,
    ledger: StateLedger,
    client: ProviderClient,
    providers: HashMap<Provider, ProviderConfig>,
    refresher: TokenRefresher,
    default_token_lifetime: Duration,
}

impl OAuthService {
    pub fn new(
        store: Arc<CredentialStore>,
        providers: Vec<ProviderConfig>,
        settings: &OAuthSettings,
    ) -> anyhow::Result<Self> {
        let client = ProviderClient::new(std::time::Duration::from_secs(
            settings.http_timeout_seconds,
        ))?;
        let default_token_lifetime = Duration::seconds(settings.default_token_lifetime_seconds);
        let refresher = TokenRefresher::new(
            Arc::clone(&store),
            client.clone(),
            Duration::seconds(settings.refresh_skew_seconds),
            default_token_lifetime,
        );

        Ok(Self {
            store,
            ledger: StateLedger::new(settings.state_ttl_seconds),
            client,
            providers: providers
                .into_iter()
                .map(|config| (config.provider.clone(), config))
                .collect(),
            refresher,
            default_token_lifetime,
        })
    }

    /// The state ledger, for the host's periodic cleanup task.
    pub fn ledger(&self) -> &StateLedger {
        &self.ledger
    }

    /// Configured providers, sorted by name.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.providers.keys().cloned().collect();
        providers.sort();
        providers
    }

    pub fn provider_config(&self, provider: &Provider) -> Result<&ProviderConfig> {
        self.providers
            .get(provider)
            .ok_or_else(|| OAuthError::UnknownProvider(provider.to_string()))
    }

    /// Builds the provider authorization URL and records a state token for
    /// `subject`. No network call.
    pub fn build_authorization_url(&self, subject: &SubjectId, provider: &Provider) -> Result<String> {
        let config = self.provider_config(provider)?;
        let state = self.ledger.issue(subject, provider)?;

        info!(subject = %subject, provider = %provider, "Starting OAuth authorization");

        Ok(config.build_auth_url(&state))
    }

    /// Completes the flow: validates `state`, exchanges `code`, stores tokens.
    ///
    /// Never retries the exchange; an authorization code is single-use.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<Connected> {
        let ValidatedState { subject, provider } =
            self.ledger.validate_and_consume(state, self.ledger.ttl()).inspect_err(|_| {
                warn!("Invalid or expired OAuth state (possible CSRF or replay)");
            })?;

        let config = self.provider_config(&provider)?;

        debug!(subject = %subject, provider = %provider, "OAuth state validated");

        let grant = self
            .client
            .exchange_code(config, code)
            .await
            .map_err(|failure| {
                warn!(
                    subject = %subject,
                    provider = %provider,
                    error = %failure,
                    "Token exchange failed"
                );
                match failure {
                    ProviderFailure::Rejected { error_code, .. } => {
                        OAuthError::CodeExchange { error_code }
                    }
                    other => OAuthError::Transient(other.to_string()),
                }
            })?;

        let expires_at = grant.expires_at(Utc::now(), self.default_token_lifetime);
        let credentials = self.store.for_subject(&subject);

        // Re-consent can come back without a refresh token; keep the old one
        let refresh_token = match grant.refresh_token {
            Some(token) => Some(token),
            None => {
                warn!(
                    subject = %subject,
                    provider = %provider,
                    "Provider issued no refresh token"
                );
                match credentials.get(&provider) {
                    Ok(stored) => stored.and_then(|s| s.credential.refresh_token),
                    Err(OAuthError::Integrity) => {
                        warn!(
                            subject = %subject,
                            provider = %provider,
                            "Previous credential unreadable, storing without refresh token"
                        );
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let credential = Credential {
            access_token: grant.access_token,
            refresh_token,
            token_type: grant.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: grant.scope.unwrap_or_else(|| config.scope_string()),
            expires_at,
        };

        credentials.put(&provider, &credential).inspect_err(|e| {
            error!(
                subject = %subject,
                provider = %provider,
                error = %e,
                "Failed to store credentials"
            );
        })?;

        info!(
            subject = %subject,
            provider = %provider,
            has_refresh_token = credential.refresh_token.is_some(),
            "OAuth flow completed successfully"
        );

        Ok(Connected { subject, provider })
    }

    /// Burns a state token whose flow the user abandoned at the provider.
    pub fn cancel_authorization(&self, state: &str) {
        if self
            .ledger
            .validate_and_consume(state, self.ledger.ttl())
            .is_ok()
        {
            debug!("OAuth authorization cancelled");
        }
    }

    /// Returns a valid plaintext access token for in-process use only.
    pub async fn get_access_token(&self, subject: &SubjectId, provider: &Provider) -> Result<String> {
        let config = self.provider_config(provider)?;
        self.refresher.get_access_token(subject, config).await
    }

    /// Whether a credential exists. Never touches token material.
    pub fn is_connected(&self, subject: &SubjectId, provider: &Provider) -> Result<bool> {
        self.provider_config(provider)?;
        self.store.for_subject(subject).contains(provider)
    }

    /// Configured providers this subject is connected to.
    pub fn connected_providers(&self, subject: &SubjectId) -> Result<Vec<Provider>> {
        let stored = self.store.for_subject(subject).list_providers()?;
        Ok(stored
            .into_iter()
            .filter(|p| self.providers.contains_key(p))
            .collect())
    }

    /// Revokes at the provider (best effort) and deletes the credential.
    ///
    /// Idempotent: disconnecting twice succeeds both times.
    pub async fn disconnect(&self, subject: &SubjectId, provider: &Provider) -> Result<Disconnected> {
        let config = self.provider_config(provider)?;
        let credentials = self.store.for_subject(subject);

        let token = match credentials.get(provider) {
            Ok(None) => {
                debug!(subject = %subject, provider = %provider, "Already disconnected");
                return Ok(Disconnected::AlreadyDisconnected);
            }
            Ok(Some(stored)) => Some(
                stored
                    .credential
                    .refresh_token
                    .unwrap_or(stored.credential.access_token),
            ),
            Err(OAuthError::Integrity) => {
                // Cannot revoke what cannot be decrypted; still honor the removal
                warn!(
                    subject = %subject,
                    provider = %provider,
                    "Skipping remote revocation for corrupted credential"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let revoked = match token {
            Some(token) => match self.client.revoke(config, &token).await {
                Ok(()) => true,
                Err(failure) => {
                    warn!(
                        subject = %subject,
                        provider = %provider,
                        error = %failure,
                        "Provider revocation failed, deleting local credential anyway"
                    );
                    false
                }
            },
            None => false,
        };

        credentials.delete(provider)?;

        info!(
            subject = %subject,
            provider = %provider,
            revoked,
            "Integration disconnected"
        );

        Ok(if revoked {
            Disconnected::Revoked
        } else {
            Disconnected::LocalOnly
        })
    }
}
