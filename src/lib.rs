// Caller identity for the HTTP adapter
pub mod auth;

// Configuration file and environment overrides
pub mod config;

// Encrypted credential storage
pub mod credentials;

// Error taxonomy
pub mod error;

// OAuth flows, refresh and revocation
pub mod oauth;

// HTTP API
pub mod api;

pub use error::{OAuthError, Result};
pub use oauth::{Connected, Disconnected, OAuthService};
