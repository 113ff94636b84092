//! Key redemption and subscription lookup for bot users.

use crate::dtos::{RegisterRequest, RegisterResponse, SubscriptionResponse, UserRequest};
use crate::models::Subscription;
use crate::services::metrics;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::rate_limit::check_keyed;
use validator::Validate;

/// `POST /api/register`
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    payload.validate()?;
    // Guessing keys costs the same budget as analysis requests.
    check_keyed(
        &state.analysis_limiter,
        &payload.user_id,
        "Too many attempts. Please wait a moment.",
    )?;

    let now = Utc::now();
    let redemption = match state
        .keys
        .redeem_key(&payload.key, &payload.user_id, now)
        .await
    {
        Ok(redemption) => {
            metrics::record_redemption("ok");
            redemption
        }
        Err(e) => {
            let outcome = match &e {
                AppError::NotFound(_) => "not_found",
                AppError::Conflict(_) => "rejected",
                _ => "error",
            };
            metrics::record_redemption(outcome);
            tracing::info!(user_id = %payload.user_id, outcome, "Registration key rejected");
            return Err(e);
        }
    };

    let days_remaining = Subscription {
        user_id: redemption.user_id.clone(),
        expires_at: redemption.expires_at,
    }
    .days_remaining(now);
    tracing::info!(
        user_id = %payload.user_id,
        expires_at = %redemption.expires_at,
        "Registration key redeemed"
    );

    Ok(Json(RegisterResponse {
        user_id: redemption.user_id,
        key: redemption.key,
        expires_at: redemption.expires_at,
        days_remaining,
        message: format!(
            "Access granted until {}.",
            redemption.expires_at.format("%Y-%m-%d %H:%M UTC")
        ),
    }))
}

/// `GET /api/subscription/:user_id`
pub async fn subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    UserRequest {
        user_id: user_id.clone(),
    }
    .validate()?;

    let subscription = state.keys.subscription(&user_id).await?;
    Ok(Json(SubscriptionResponse::from_subscription(
        &user_id,
        subscription.as_ref(),
        Utc::now(),
    )))
}
