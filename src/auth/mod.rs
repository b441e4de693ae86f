//! Caller identity for the HTTP adapter.
//!
//! The platform gateway authenticates users and forwards the subject as
//! `Authorization: Bearer <subject>`. This module only parses it.

use crate::credentials::{IdentityError, SubjectId};
use axum::http::HeaderMap;
use thiserror::Error;


/// Extract the calling subject from the Authorization header.
pub fn extract_subject(headers: &HeaderMap) -> Result<SubjectId, AuthError> {
    let token = extract_bearer_token(headers)?;
    SubjectId::new(token).map_err(AuthError::InvalidSubject)
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, AuthError> {
    let Some((scheme, token)) = header_value.split_once(' ') else {
        return Err(AuthError::InvalidFormat);
    };

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Empty);
    }

    Ok(token.to_string())
}

/// Why a request carries no usable subject
#[derive(Debug, Error, PartialEq, Clone)]
pub enum AuthError {
    #[error("Authorization token not provided")]
    Missing,
    #[error("Invalid authorization token format")]
    InvalidFormat,
    #[error("Authorization token is empty")]
    Empty,
    #[error("Invalid subject: {0}")]
    InvalidSubject(IdentityError),
}
