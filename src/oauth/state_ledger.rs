//! Single-use OAuth state tokens for CSRF protection.
//!
//! Correlates an authorization redirect with the subject (and provider) that
//! started it. Tokens are consumed atomically under one lock, so two callbacks
//! carrying the same token cannot both succeed.

use crate::credentials::{Provider, SubjectId};
use crate::error::{OAuthError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Random bytes per state token (256 bits)
const STATE_TOKEN_BYTES: usize = 32;

/// OAuth state entry
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub subject: SubjectId,
    pub provider: Provider,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

/// Subject and provider recovered from a valid state token.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedState {
    pub subject: SubjectId,
    pub provider: Provider,
}

/// In-memory ledger of issued state tokens with expiry.
#[derive(Clone)]
pub struct StateLedger {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    ttl: Duration,
}

impl StateLedger {
    /// Create a new ledger
    ///
    /// # Arguments
    /// * `ttl_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new state token for `subject` starting a flow with `provider`.
    pub fn issue(&self, subject: &SubjectId, provider: &Provider) -> Result<String> {
        let token = generate_state_token();
        let now = Utc::now();
        let entry = StateEntry {
            subject: subject.clone(),
            provider: provider.clone(),
            created_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };

        self.lock()?.insert(token.clone(), entry);

        Ok(token)
    }

    /// Validate and consume a state token.
    ///
    /// Unknown, consumed, expired, or older-than-`max_age` tokens all yield
    /// the same `OAuthError::InvalidState`.
    pub fn validate_and_consume(&self, token: &str, max_age: Duration) -> Result<ValidatedState> {
        let mut states = self.lock()?;
        let entry = states.get_mut(token).ok_or(OAuthError::InvalidState)?;

        if entry.consumed {
            return Err(OAuthError::InvalidState);
        }

        // Flag before checking age: an expired token is burned too
        entry.consumed = true;

        let now = Utc::now();
        if now >= entry.expires_at || now - entry.created_at > max_age {
            return Err(OAuthError::InvalidState);
        }

        Ok(ValidatedState {
            subject: entry.subject.clone(),
            provider: entry.provider.clone(),
        })
    }

    /// Drop entries past `expires_at`, consumed or not.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let mut states = self.lock()?;
        let before = states.len();
        let now = Utc::now();

        states.retain(|_, entry| entry.expires_at > now);

        Ok(before - states.len())
    }

    /// Get count of entries still held (for monitoring)
    pub fn pending_count(&self) -> usize {
        self.lock().map(|states| states.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StateEntry>>> {
        self.states
            .lock()
            .map_err(|_| OAuthError::Storage("state ledger lock poisoned".to_string()))
    }
}

/// Background task to periodically clean up expired states.
///
/// An interval of 0 is treated as 1 second.
pub async fn run_state_cleanup(ledger: StateLedger, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        match ledger.cleanup_expired() {
            Ok(removed) => tracing::debug!(
                removed,
                remaining = ledger.pending_count(),
                "OAuth state cleanup complete"
            ),
            Err(e) => tracing::error!(error = %e, "OAuth state cleanup failed"),
        }
    }
}

fn generate_state_token() -> String {
    let mut bytes = [0u8; STATE_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
