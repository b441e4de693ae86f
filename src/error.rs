//! Error taxonomy for the integration credential subsystem.
//!
//! Every failure a caller can observe is one of these variants, so HTTP
//! handlers and integration call sites can match on the kind instead of
//! parsing strings. Provider error bodies never end up in a variant's
//! message; only the OAuth `error` code is kept.

use thiserror::Error;

/// Errors surfaced by the OAuth credential subsystem.
///
/// `Clone` because a single in-flight refresh hands the same outcome to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OAuthError {
    /// State token missing, expired, replayed, or never issued.
    #[error("Invalid or expired authorization state")]
    InvalidState,

    /// Provider rejected the authorization code. Not retryable.
    #[error("Authorization code exchange rejected by provider: {error_code}")]
    CodeExchange { error_code: String },

    /// Network, timeout, or 5xx failure talking to the provider.
    #[error("Transient provider failure: {0}")]
    Transient(String),

    /// Refresh token rejected. The stored credential has already been deleted.
    #[error("Reauthorization required")]
    ReauthorizationRequired,

    /// Refresh rejected for a reason other than a revoked grant
    /// (e.g. `invalid_client`). The credential is kept.
    #[error("Token refresh rejected by provider: {error_code}")]
    RefreshRejected { error_code: String },

    /// No credential stored for this subject and provider.
    #[error("Integration not connected")]
    NotConnected,

    /// Stored ciphertext failed authentication or could not be parsed.
    #[error("Stored credential failed integrity check")]
    Integrity,

    /// Provider is not configured.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Credential database failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl OAuthError {
    /// Stable machine-readable kind. This is the only error text exposed to
    /// end users.
    pub fn kind(&self) -> &'static str {
        match self {
            OAuthError::InvalidState => "invalid_state",
            OAuthError::CodeExchange { .. } => "code_exchange_failed",
            OAuthError::Transient(_) => "transient",
            OAuthError::ReauthorizationRequired => "reauthorization_required",
            OAuthError::RefreshRejected { .. } => "refresh_rejected",
            OAuthError::NotConnected => "not_connected",
            OAuthError::Integrity => "integrity",
            OAuthError::UnknownProvider(_) => "unknown_provider",
            OAuthError::Storage(_) => "storage",
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OAuthError::Transient(_))
    }
}

impl From<rusqlite::Error> for OAuthError {
    fn from(e: rusqlite::Error) -> Self {
        OAuthError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OAuthError>;
