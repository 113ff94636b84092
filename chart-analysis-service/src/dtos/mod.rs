use crate::models::{
    AnalysisAction, AnalysisStage, RegistrationKey, Subscription, MAX_DURATION_DAYS,
};
use crate::utils::{Instrument, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// JSON body for `/api/webhook`. The image is either a URL the service
/// downloads or inline base64.
#[derive(Debug, Deserialize, Validate)]
pub struct WebhookRequest {
    #[validate(length(min = 1, max = 128, message = "user_id must be 1-128 characters"))]
    pub user_id: String,

    pub action: Option<AnalysisAction>,

    #[validate(length(max = 4000, message = "text must be at most 4000 characters"))]
    pub text: Option<String>,

    #[validate(length(max = 2048, message = "image_url is too long"))]
    pub image_url: Option<String>,

    pub image_base64: Option<String>,

    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UserRequest {
    #[validate(length(min = 1, max = 128, message = "user_id must be 1-128 characters"))]
    pub user_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 128, message = "user_id must be 1-128 characters"))]
    pub user_id: String,

    #[validate(length(min = 1, max = 64, message = "key must be 1-64 characters"))]
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
    pub days_remaining: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub user_id: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_remaining: i64,
}

impl SubscriptionResponse {
    pub fn from_subscription(
        user_id: &str,
        subscription: Option<&Subscription>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            active: subscription.is_some_and(|s| s.is_active(now)),
            expires_at: subscription.map(|s| s.expires_at),
            days_remaining: subscription.map_or(0, |s| s.days_remaining(now)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChartSummary {
    pub timeframe: Option<Timeframe>,
    pub instrument: Option<Instrument>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user_id: String,
    pub stage: AnalysisStage,
    pub first_chart: Option<ChartSummary>,
    pub second_chart: Option<ChartSummary>,
    pub updated_at: Option<DateTime<Utc>>,
    pub next_step: &'static str,
}

/// Admin form for issuing keys.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateKeysForm {
    #[validate(range(min = 1, max = 100, message = "count must be between 1 and 100"))]
    pub count: usize,

    #[validate(range(min = 1, max = MAX_DURATION_DAYS, message = "duration must be between 1 and 3650 days"))]
    pub duration_days: i32,

    #[validate(length(max = 200, message = "note must be at most 200 characters"))]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct DashboardQuery {
    #[serde(default)]
    pub filter: crate::models::KeyFilter,
    #[serde(default)]
    pub page: Option<u32>,
}

/// A key as shown on the dashboard.
#[derive(Debug)]
pub struct KeyRow {
    pub key: String,
    pub status: &'static str,
    pub duration_days: i32,
    pub note: String,
    pub created_at: String,
    pub redeemed_by: String,
    pub expires_at: String,
    pub revocable: bool,
}

impl KeyRow {
    pub fn from_key(key: &RegistrationKey, now: DateTime<Utc>) -> Self {
        let status = key.status(now);
        let fmt = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        Self {
            key: key.key.clone(),
            status: status.as_str(),
            duration_days: key.duration_days,
            note: key.note.clone().unwrap_or_default(),
            created_at: fmt(Some(key.created_at)),
            redeemed_by: key.redeemed_by.clone().unwrap_or_else(|| "-".to_string()),
            expires_at: fmt(key.expires_at),
            revocable: key.revoked_at.is_none(),
        }
    }
}
