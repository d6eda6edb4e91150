use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;

use crate::config::StatusConfig;
use super::StatusState;

/// Basic auth credentials for the status server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    /// `None` when both user and password are empty.
    pub fn from_config(config: &StatusConfig) -> Option<Self> {
        if config.user.is_empty() && config.password.is_empty() {
            return None;
        }
        Some(Self {
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Check an `Authorization` header value.
    pub fn matches(&self, header_value: &str) -> bool {
        let Some(encoded) = header_value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, password)) => user == self.user && password == self.password,
            None => false,
        }
    }
}

/// Reject requests without valid basic credentials with 401.
/// Passes everything through when no credentials are configured.
pub async fn basic_auth_middleware(
    State(state): State<StatusState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(credentials) = &state.credentials else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|value| credentials.matches(value));

    if authorized {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"router\"")],
        "401 Unauthorized\n",
    )
        .into_response()
}
