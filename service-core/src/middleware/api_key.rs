//! Shared-secret authentication for machine callers.
//!
//! The messaging bot sends a static token in a header; the token is compared
//! in constant time. When no token is configured every request passes, which
//! is how local development runs.

use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub const API_TOKEN_HEADER: &str = "x-bot-token";

#[derive(Clone, Default)]
pub struct ApiKeyConfig {
    pub token: Option<Arc<str>>,
}

impl ApiKeyConfig {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    pub fn verify(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(expected), Some(given)) => {
                expected.as_bytes().ct_eq(given.as_bytes()).into()
            }
            (Some(_), None) => false,
        }
    }
}

pub async fn api_key_middleware(
    State(config): State<ApiKeyConfig>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = request
        .headers()
        .get(API_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    if config.verify(presented) {
        Ok(next.run(request).await)
    } else {
        tracing::warn!(path = %request.uri().path(), "Rejected request with invalid bot token");
        Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid or missing bot token"
        )))
    }
}
