//! HTTP Basic authentication for webhook routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;
use tracing::warn;

const REALM: &str = "Basic realm=\"sms-over-xmpp\"";

/// Credentials a carrier must present when calling our webhooks.
///
/// Any username is accepted unless one is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    username: Option<String>,
    password: String,
}

impl BasicAuth {
    pub fn new(username: Option<String>, password: impl Into<String>) -> Self {
        Self {
            username,
            password: password.into(),
        }
    }

    /// Check an `Authorization` header value.
    pub fn verify(&self, header: &str) -> bool {
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, password)) = decoded.split_once(':') else {
            return false;
        };

        let password_ok: bool = password.as_bytes().ct_eq(self.password.as_bytes()).into();
        let user_ok: bool = match &self.username {
            Some(expected) => user.as_bytes().ct_eq(expected.as_bytes()).into(),
            None => true,
        };
        password_ok & user_ok
    }
}

/// Middleware rejecting requests without valid credentials.
pub async fn require_basic_auth(
    State(auth): State<Arc<BasicAuth>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| auth.verify(value));

    if authorized {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "webhook request failed authentication");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM))],
        "401 Unauthorized\n",
    )
        .into_response()
}
