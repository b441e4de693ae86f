//! Expiry-aware access token retrieval with single-flight refresh.
//!
//! A token is served from the store while `now < expires_at - skew`. Past
//! that point one refresh per (subject, provider) goes to the provider;
//! concurrent callers wait for it and get the same token.

use super::exchange::{ProviderClient, ProviderFailure};
use super::provider::ProviderConfig;
use super::single_flight::SingleFlight;
use crate::credentials::{Credential, CredentialStore, Provider, SubjectId};
use crate::error::{OAuthError, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// OAuth error code meaning the refresh token is revoked or expired.
const INVALID_GRANT: &str = "invalid_grant";

pub struct TokenRefresher {
    store: Arc<CredentialStore>,
    client: ProviderClient,
    flights: SingleFlight<(SubjectId, Provider), String>,
    skew: Duration,
    default_lifetime: Duration,
}

impl TokenRefresher {
    /// # Arguments
    /// * `skew` - Safety margin subtracted from `expires_at`
    /// * `default_lifetime` - Token lifetime assumed when the provider omits `expires_in`
    pub fn new(
        store: Arc<CredentialStore>,
        client: ProviderClient,
        skew: Duration,
        default_lifetime: Duration,
    ) -> Self {
        Self {
            store,
            client,
            flights: SingleFlight::new(),
            skew,
            default_lifetime,
        }
    }

    /// Returns a usable plaintext access token, refreshing it if needed.
    pub async fn get_access_token(
        &self,
        subject: &SubjectId,
        config: &ProviderConfig,
    ) -> Result<String> {
        let provider = &config.provider;
        let stored = self
            .store
            .for_subject(subject)
            .get(provider)?
            .ok_or(OAuthError::NotConnected)?;

        if stored.credential.is_fresh(Utc::now(), self.skew) {
            return Ok(stored.credential.access_token);
        }

        debug!(subject = %subject, provider = %provider, "Access token due for refresh");

        let job = RefreshJob {
            store: Arc::clone(&self.store),
            client: self.client.clone(),
            config: config.clone(),
            subject: subject.clone(),
            skew: self.skew,
            default_lifetime: self.default_lifetime,
        };

        self.flights
            .run((subject.clone(), provider.clone()), move || job.run())
            .await
    }

    /// Number of refreshes currently in progress.
    pub fn refreshes_in_flight(&self) -> usize {
        self.flights.in_flight()
    }
}

/// Everything one refresh needs, owned so it can outlive the caller.
struct RefreshJob {
    store: Arc<CredentialStore>,
    client: ProviderClient,
    config: ProviderConfig,
    subject: SubjectId,
    skew: Duration,
    default_lifetime: Duration,
}

impl RefreshJob {
    async fn run(self) -> Result<String> {
        let provider = &self.config.provider;
        let credentials = self.store.for_subject(&self.subject);

        // Re-read: a flight that just finished may already have refreshed
        let stored = credentials
            .get(provider)?
            .ok_or(OAuthError::NotConnected)?
            .credential;
        if stored.is_fresh(Utc::now(), self.skew) {
            return Ok(stored.access_token);
        }

        let Some(refresh_token) = stored.refresh_token.clone() else {
            warn!(
                subject = %self.subject,
                provider = %provider,
                "Access token expired and no refresh token stored, removing credential"
            );
            return self.remove_stale(&stored);
        };

        info!(subject = %self.subject, provider = %provider, "Refreshing OAuth token");

        match self.client.refresh(&self.config, &refresh_token).await {
            Ok(grant) => {
                let expires_at = grant.expires_at(Utc::now(), self.default_lifetime);

                // Keep the existing refresh token if the provider did not rotate it
                let updated = credentials.update_access_token(
                    provider,
                    &grant.access_token,
                    grant.refresh_token.as_deref(),
                    grant.scope.as_deref(),
                    expires_at,
                )?;
                if !updated {
                    warn!(
                        subject = %self.subject,
                        provider = %provider,
                        "Credential removed while refresh was in flight"
                    );
                    return Err(OAuthError::NotConnected);
                }

                info!(
                    subject = %self.subject,
                    provider = %provider,
                    rotated_refresh_token = grant.refresh_token.is_some(),
                    "OAuth token refreshed successfully"
                );
                Ok(grant.access_token)
            }
            Err(ProviderFailure::Rejected { error_code, .. }) if error_code == INVALID_GRANT => {
                warn!(
                    subject = %self.subject,
                    provider = %provider,
                    "Refresh token rejected, removing credential"
                );
                self.remove_stale(&stored)
            }
            Err(ProviderFailure::Rejected { error_code, .. }) => {
                warn!(
                    subject = %self.subject,
                    provider = %provider,
                    error_code = %error_code,
                    "Token refresh rejected"
                );
                Err(OAuthError::RefreshRejected { error_code })
            }
            Err(failure) => {
                warn!(
                    subject = %self.subject,
                    provider = %provider,
                    error = %failure,
                    "Token refresh failed, credential kept"
                );
                Err(OAuthError::Transient(failure.to_string()))
            }
        }
    }

    /// Deletes the credential this job read, unless a reconnect replaced it
    /// in the meantime.
    fn remove_stale(&self, stale: &Credential) -> Result<String> {
        let credentials = self.store.for_subject(&self.subject);
        if credentials.delete_if_unchanged(&self.config.provider, stale)? {
            return Err(OAuthError::ReauthorizationRequired);
        }
        if !credentials.contains(&self.config.provider)? {
            return Err(OAuthError::NotConnected);
        }

        info!(
            subject = %self.subject,
            provider = %self.config.provider,
            "Credential replaced while refresh was in flight, keeping it"
        );
        Err(OAuthError::Transient(
            "credential replaced during refresh".to_string(),
        ))
    }
}
