//! Admin API authentication: a single shared bearer token, compared in
//! constant time. No sessions, no users, no login flow — the daemon has
//! exactly one operator credential (spec §1 Non-goals: "authenticated user
//! sessions other than a shared bearer token").

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::AppState;

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = header_value else {
        return Err(ApiError::unauthorized("missing bearer token"));
    };

    let expected = state.config.auth.admin_token.as_bytes();
    let provided = token.as_bytes();

    let matches = expected.len() == provided.len() && bool::from(expected.ct_eq(provided));
    if !matches {
        return Err(ApiError::unauthorized("invalid bearer token"));
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use subtle::ConstantTimeEq;

    #[test]
    fn equal_tokens_compare_equal() {
        let a = b"same-token";
        let b = b"same-token";
        assert!(bool::from(a.ct_eq(b)));
    }

    #[test]
    fn different_length_tokens_are_rejected_before_compare() {
        let expected = b"abc";
        let provided = b"abcd";
        assert_ne!(expected.len(), provided.len());
    }
}
