use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
}

/// Compare a presented bearer credential with the configured secret, byte for byte.
/// A missing credential is rejected.
pub fn authorize(presented: Option<&str>, expected: &str) -> AuthDecision {
    match presented {
        Some(token) if token.as_bytes() == expected.as_bytes() => AuthDecision::Accept,
        _ => AuthDecision::Reject,
    }
}

/// Credentials from an `Authorization` header value. The scheme is matched
/// case-insensitively; everything after the first space is returned as-is.
pub fn bearer_credentials(value: &str) -> Option<&str> {
    let (scheme, credentials) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(credentials)
}

/// The process-wide bearer secret (`AUTH_TOKEN`). Unset means every
/// authenticated route answers 500.
#[derive(Clone, Default)]
pub struct BearerSecret(Option<Arc<str>>);

impl BearerSecret {
    pub fn new(token: Option<String>) -> Self {
        Self(token.map(Arc::from))
    }

    pub fn is_configured(&self) -> bool {
        self.0.is_some()
    }
}

impl std::fmt::Debug for BearerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = if self.is_configured() { "<redacted>" } else { "<unset>" };
        f.debug_tuple("BearerSecret").field(&shown).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    Unauthorized,
    NotConfigured,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            AuthRejection::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(json!({ "detail": "Incorrect bearer token" })),
            )
                .into_response(),
            AuthRejection::NotConfigured => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "auth not configured" })),
            )
                .into_response(),
        }
    }
}

/// Extractor guarding a handler behind `Authorization: Bearer <AUTH_TOKEN>`.
/// Place it before any body extractor so the check runs first.
#[derive(Debug, Clone, Copy)]
pub struct Authorized;

impl<S> FromRequestParts<S> for Authorized
where
    BearerSecret: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let secret = BearerSecret::from_ref(state);
        let Some(expected) = secret.0.as_deref() else {
            error!("AUTH_TOKEN is not set; authenticated routes are disabled");
            return Err(AuthRejection::NotConfigured);
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_credentials);
        match authorize(presented, expected) {
            AuthDecision::Accept => Ok(Authorized),
            AuthDecision::Reject => {
                warn!(
                    path = %parts.uri.path(),
                    had_credentials = presented.is_some(),
                    "rejected bearer token"
                );
                Err(AuthRejection::Unauthorized)
            }
        }
    }
}
