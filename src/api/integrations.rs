//! HTTP endpoints for connecting, inspecting and disconnecting integrations.
//!
//! Flow:
//! 1. User clicks "Connect" in the school UI
//! 2. GET /api/integrations/:provider/connect → Redirect to provider
//! 3. User authorizes on provider's site
//! 4. Provider redirects to /api/integrations/oauth/callback
//! 5. Code exchanged, encrypted credentials stored
//!
//! Access tokens never leave the process through these endpoints.

use crate::auth::{extract_subject, AuthError};
use crate::credentials::{Provider, SubjectId};
use crate::error::OAuthError;
use crate::oauth::{Disconnected, OAuthService};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
}

/// Application error types for integration endpoints
#[derive(Debug)]
pub enum AppError {
    Unauthorized(AuthError),
    BadRequest(&'static str),
    OAuth(OAuthError),
}

impl AppError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::BadRequest(kind) => (StatusCode::BAD_REQUEST, kind),
            AppError::OAuth(e) => {
                let status = match e {
                    OAuthError::InvalidState | OAuthError::CodeExchange { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    OAuthError::NotConnected | OAuthError::UnknownProvider(_) => {
                        StatusCode::NOT_FOUND
                    }
                    OAuthError::ReauthorizationRequired => StatusCode::CONFLICT,
                    OAuthError::Transient(_) | OAuthError::RefreshRejected { .. } => {
                        StatusCode::BAD_GATEWAY
                    }
                    OAuthError::Integrity | OAuthError::Storage(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.kind())
            }
        }
    }
}

impl From<OAuthError> for AppError {
    fn from(e: OAuthError) -> Self {
        AppError::OAuth(e)
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        AppError::Unauthorized(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            error!(error = ?self, "Integration request failed");
        } else {
            debug!(error = ?self, "Integration request rejected");
        }

        (status, Json(ErrorResponse { error: kind })).into_response()
    }
}

/// Shared application state for integration endpoints
#[derive(Clone)]
pub struct IntegrationsAppState {
    pub service: Arc<OAuthService>,
}

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Connection status of one provider
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IntegrationStatus {
    pub provider: String,
    pub connected: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntegrationList {
    pub integrations: Vec<IntegrationStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectedResponse {
    pub success: bool,
    pub provider: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub provider: String,
    pub outcome: String,
}

/// Create integrations API router
pub fn create_integrations_router(state: IntegrationsAppState) -> Router {
    Router::new()
        .route("/api/integrations", get(list_integrations))
        .route("/api/integrations/oauth/callback", get(oauth_callback))
        .route("/api/integrations/:provider/connect", get(connect))
        .route("/api/integrations/:provider/status", get(status))
        .route("/api/integrations/:provider", delete(disconnect))
        .with_state(Arc::new(state))
}

fn parse_provider(name: &str) -> Result<Provider, AppError> {
    Provider::new(name).map_err(|_| AppError::OAuth(OAuthError::UnknownProvider(name.to_string())))
}

fn outcome_name(outcome: Disconnected) -> &'static str {
    match outcome {
        Disconnected::Revoked => "revoked",
        Disconnected::LocalOnly => "local_only",
        Disconnected::AlreadyDisconnected => "already_disconnected",
    }
}

/// GET /api/integrations
///
/// Connection status for every configured provider.
async fn list_integrations(
    State(state): State<Arc<IntegrationsAppState>>,
    headers: HeaderMap,
) -> Result<Json<IntegrationList>, AppError> {
    let subject = extract_subject(&headers)?;
    let connected = state.service.connected_providers(&subject)?;

    let integrations = state
        .service
        .providers()
        .into_iter()
        .map(|provider| IntegrationStatus {
            connected: connected.contains(&provider),
            provider: provider.to_string(),
        })
        .collect();

    Ok(Json(IntegrationList { integrations }))
}

/// GET /api/integrations/:provider/connect
///
/// Redirects the user to the provider's consent page.
async fn connect(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    let subject: SubjectId = extract_subject(&headers)?;
    let provider = parse_provider(&provider)?;

    let auth_url = state.service.build_authorization_url(&subject, &provider)?;

    Ok(Redirect::temporary(&auth_url))
}

/// GET /api/integrations/oauth/callback
///
/// Unauthenticated: the state token identifies the subject.
async fn oauth_callback(
    State(state): State<Arc<IntegrationsAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<ConnectedResponse>, AppError> {
    if let Some(provider_error) = callback.error {
        warn!(error = %provider_error, "OAuth authorization denied at provider");
        if let Some(csrf_state) = &callback.state {
            state.service.cancel_authorization(csrf_state);
        }
        return Err(AppError::BadRequest("authorization_denied"));
    }

    let code = callback.code.ok_or(AppError::BadRequest("invalid_request"))?;
    let csrf_state = callback.state.ok_or(AppError::OAuth(OAuthError::InvalidState))?;

    let connected = state.service.handle_callback(&code, &csrf_state).await?;

    Ok(Json(ConnectedResponse {
        success: true,
        provider: connected.provider.to_string(),
    }))
}

/// GET /api/integrations/:provider/status
async fn status(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<IntegrationStatus>, AppError> {
    let subject = extract_subject(&headers)?;
    let provider = parse_provider(&provider)?;

    let connected = state.service.is_connected(&subject, &provider)?;

    Ok(Json(IntegrationStatus {
        provider: provider.to_string(),
        connected,
    }))
}

/// DELETE /api/integrations/:provider
///
/// Idempotent; succeeds even when nothing was connected.
async fn disconnect(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let subject = extract_subject(&headers)?;
    let provider = parse_provider(&provider)?;

    let outcome = state.service.disconnect(&subject, &provider).await?;

    Ok(Json(DisconnectResponse {
        provider: provider.to_string(),
        outcome: outcome_name(outcome).to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: OAuthError) -> (StatusCode, &'static str) {
        AppError::OAuth(e).status_and_kind()
    }

    #[test]
    fn test_oauth_callback_deserialization() {
        let query = "code=auth_code_123&state=csrf_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code.as_deref(), Some("auth_code_123"));
        assert_eq!(callback.state.as_deref(), Some("csrf_state_456"));
        assert_eq!(callback.error, None);

        let query = "error=access_denied&state=csrf_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error.as_deref(), Some("access_denied"));
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_of(OAuthError::InvalidState),
            (StatusCode::BAD_REQUEST, "invalid_state")
        );
        assert_eq!(
            status_of(OAuthError::CodeExchange {
                error_code: "invalid_grant".to_string()
            }),
            (StatusCode::BAD_REQUEST, "code_exchange_failed")
        );
        assert_eq!(
            status_of(OAuthError::NotConnected),
            (StatusCode::NOT_FOUND, "not_connected")
        );
        assert_eq!(
            status_of(OAuthError::UnknownProvider("zoom".to_string())),
            (StatusCode::NOT_FOUND, "unknown_provider")
        );
        assert_eq!(
            status_of(OAuthError::ReauthorizationRequired),
            (StatusCode::CONFLICT, "reauthorization_required")
        );
        assert_eq!(
            status_of(OAuthError::Transient("timeout".to_string())),
            (StatusCode::BAD_GATEWAY, "transient")
        );
        assert_eq!(
            status_of(OAuthError::Integrity),
            (StatusCode::INTERNAL_SERVER_ERROR, "integrity")
        );
        assert_eq!(
            status_of(OAuthError::Storage("disk I/O error".to_string())),
            (StatusCode::INTERNAL_SERVER_ERROR, "storage")
        );
    }

    #[test]
    fn test_unauthorized_mapping() {
        let (status, kind) = AppError::Unauthorized(AuthError::Missing).status_and_kind();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(kind, "unauthorized");
    }

    #[test]
    fn test_invalid_provider_name_is_unknown() {
        assert!(matches!(
            parse_provider("Google Meet"),
            Err(AppError::OAuth(OAuthError::UnknownProvider(_)))
        ));
        assert!(parse_provider("google_meet").is_ok());
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(outcome_name(Disconnected::Revoked), "revoked");
        assert_eq!(outcome_name(Disconnected::LocalOnly), "local_only");
        assert_eq!(
            outcome_name(Disconnected::AlreadyDisconnected),
            "already_disconnected"
        );
    }
}
