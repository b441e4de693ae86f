//! Encrypted, ownership-scoped storage for OAuth credentials.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  CredentialStore::for_subject(&subject)  │
//! │  → SubjectCredentials (put/get/delete)   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!        (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │  Envelope                                │
//! │  - AES-256-GCM, random nonce per token   │
//! │  - key version embedded in ciphertext    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │  SQLite                                  │
//! │  - ciphertext only, keyed by             │
//! │    (subject_id, provider)                │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use lessonlink::credentials::{Credential, CredentialStore, Envelope, Provider, SubjectId};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let envelope = Envelope::from_base64_key(&std::env::var("LESSONLINK_ENCRYPTION_KEY")?)?;
//! let store = CredentialStore::new("credentials.db", envelope)?;
//!
//! let subject = SubjectId::new("user-1")?;
//! let provider = Provider::new("google_meet")?;
//!
//! let credentials = store.for_subject(&subject);
//! credentials.put(&provider, &Credential {
//!     access_token: "AT1".to_string(),
//!     refresh_token: Some("RT1".to_string()),
//!     token_type: "Bearer".to_string(),
//!     scope: "https://www.googleapis.com/auth/calendar.events".to_string(),
//!     expires_at: Utc::now() + Duration::hours(1),
//! })?;
//!
//! assert!(credentials.contains(&provider)?);
//! credentials.delete(&provider)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod storage;

pub use encryption::{validate_key, Envelope};
pub use storage::{CredentialStore, StoredCredential, SubjectCredentials};

/// Platform identity on whose behalf credentials are held.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Rules: non-empty, at most 128 characters, no control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::Empty);
        }
        if id.len() > 128 {
            return Err(IdentityError::TooLong);
        }
        if let Some(c) = id.chars().find(|c| c.is_control()) {
            return Err(IdentityError::InvalidCharacters(format!(
                "Invalid control character {:?} in subject id",
                c
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of an integrated OAuth provider (e.g. `google_meet`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provider(String);

impl Provider {
    /// Rules: 1-32 characters, lowercase alphanumeric + underscore
    pub fn new(name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdentityError::Empty);
        }
        if name.len() > 32 {
            return Err(IdentityError::TooLong);
        }
        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '_' {
                return Err(IdentityError::InvalidCharacters(format!(
                    "Invalid character '{}' (must be [a-z0-9_])",
                    c
                )));
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upper-cased form used in environment variable names.
    pub fn env_prefix(&self) -> String {
        self.0.to_uppercase()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity validation errors
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("Identifier is empty")]
    Empty,
    #[error("Identifier is too long")]
    TooLong,
    #[error("{0}")]
    InvalidCharacters(String),
}

/// One subject's authorization grant for one provider, decrypted.
///
/// Only ever held in process memory. Deliberately not `Serialize`, and
/// `Debug` redacts the tokens.
#[derive(Clone, PartialEq)]
pub struct Credential {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    pub refresh_token: Option<String>,

    /// Usually `Bearer`
    pub token_type: String,

    /// Space-delimited scopes granted by the provider
    pub scope: String,

    /// After this instant the access token must not be used without refresh
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True while `now < expires_at - skew`.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        now < self.expires_at - skew
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
