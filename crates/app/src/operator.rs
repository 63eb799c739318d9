use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
};
use tracing::warn;

use crate::confirmation::{hash_token, hashes_match};
use crate::problem::ProblemResponse;
use crate::router::AppState;

const BEARER_PREFIX: &str = "Bearer ";

/// Grants access to operator routes; requires
/// `Authorization: Bearer <OPERATOR_API_KEY>`.
#[derive(Debug, Clone, Copy)]
pub struct OperatorAccess;

#[axum::async_trait]
impl FromRequestParts<AppState> for OperatorAccess {
    type Rejection = ProblemResponse;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.operator_key() else {
            warn!(stage = "operator", "operator route called but OPERATOR_API_KEY is not set");
            return Err(unauthorized());
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(unauthorized)?;

        // equal-length digests keep the comparison constant-time
        if hashes_match(&hash_token(presented), &hash_token(expected)) {
            Ok(Self)
        } else {
            warn!(stage = "operator", "rejected operator credential");
            Err(unauthorized())
        }
    }
}

fn unauthorized() -> ProblemResponse {
    ProblemResponse::new(
        StatusCode::UNAUTHORIZED,
        "operator_unauthorized",
        "a valid operator bearer token is required",
    )
}
