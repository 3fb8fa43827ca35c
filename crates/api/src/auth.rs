//! Bearer-token middleware for the read and admin endpoints

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Constant-time comparison so response timing does not leak the token
fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

/// Middleware that requires `Authorization: Bearer <API_TOKEN>`
pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match extract_bearer_token(&request) {
        Some(token) if token_matches(token, &state.config.api_token) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "require_api_token: invalid token");
            ApiError::Unauthorized.into_response()
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "require_api_token: missing token");
            ApiError::Unauthorized.into_response()
        }
    }
}
