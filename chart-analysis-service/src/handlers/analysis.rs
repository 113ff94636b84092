//! Bot-facing analysis endpoints.

use crate::dtos::{ChartSummary, SessionResponse, UserRequest, WebhookRequest};
use crate::models::{AnalysisAction, AnalysisStage, ChartRecord};
use crate::services::providers::ChartImage;
use crate::services::{AnalysisInput, AnalysisOutcome};
use crate::startup::AppState;
use crate::utils::check_chart_image;
use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::rate_limit::check_keyed;
use validator::Validate;

/// Multipart fields that may carry the chart.
const IMAGE_FIELDS: &[&str] = &["image", "photo", "file", "chart"];

/// `POST /api/analyze` (multipart: `user_id`, `action`, `text`, `image`).
pub async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<AnalysisOutcome>, AppError> {
    let mut user_id = None;
    let mut action = None;
    let mut text = None;
    let mut image: Option<(Vec<u8>, Option<String>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if IMAGE_FIELDS.contains(&name.as_str()) {
            let declared = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(multipart_error)?;
            image = Some((bytes.to_vec(), declared));
            continue;
        }

        let value = field.text().await.map_err(multipart_error)?;
        match name.as_str() {
            "user_id" => user_id = Some(value),
            "action" if !value.trim().is_empty() => action = Some(parse_action(&value)?),
            "text" | "caption" => text = Some(value),
            _ => tracing::debug!(field = %name, "Ignoring unknown multipart field"),
        }
    }

    let user = UserRequest {
        user_id: user_id
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("user_id is required")))?,
    };
    user.validate()?;

    let image = match image {
        Some((bytes, declared)) => Some(chart_image(&state, bytes, declared.as_deref())?),
        None => None,
    };

    let input = AnalysisInput {
        action,
        text,
        image,
    };
    run(&state, &user.user_id, input).await
}

/// `POST /api/webhook` (JSON, image by URL or inline base64).
pub async fn webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookRequest>,
) -> Result<Json<AnalysisOutcome>, AppError> {
    payload.validate()?;

    if payload.image_url.is_some() && payload.image_base64.is_some() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Send either image_url or image_base64, not both"
        )));
    }

    // Access checks happen before any download.
    gate(&state, &payload.user_id, payload.action).await?;

    let image = if let Some(encoded) = payload.image_base64.as_deref() {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("image_base64 is invalid: {}", e)))?;
        Some(chart_image(&state, bytes, payload.mime_type.as_deref())?)
    } else if let Some(url) = payload.image_url.as_deref() {
        let fetched = state.fetcher.fetch(url).await?;
        let declared = payload.mime_type.as_deref().or(fetched.content_type.as_deref());
        Some(chart_image(&state, fetched.bytes, declared)?)
    } else {
        None
    };

    let input = AnalysisInput {
        action: payload.action,
        text: payload.text,
        image,
    };
    let outcome = state.analyzer.handle(&payload.user_id, input).await?;
    Ok(Json(outcome))
}

/// `POST /api/reset`
pub async fn reset(
    State(state): State<AppState>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<AnalysisOutcome>, AppError> {
    payload.validate()?;
    let input = AnalysisInput {
        action: Some(AnalysisAction::Reset),
        ..Default::default()
    };
    let outcome = state.analyzer.handle(&payload.user_id, input).await?;
    tracing::info!(user_id = %payload.user_id, "Session reset");
    Ok(Json(outcome))
}

/// `GET /api/session/:user_id`
pub async fn get_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    UserRequest {
        user_id: user_id.clone(),
    }
    .validate()?;

    let summary = |r: &ChartRecord| ChartSummary {
        timeframe: r.timeframe,
        instrument: r.instrument.clone(),
        analyzed_at: r.analyzed_at,
    };

    let response = match state.analyzer.sessions().snapshot(&user_id).await {
        Some(session) => SessionResponse {
            user_id,
            stage: session.stage,
            first_chart: session.first.as_ref().map(summary),
            second_chart: session.second.as_ref().map(summary),
            updated_at: Some(session.updated_at),
            next_step: session.stage.next_step(),
        },
        None => SessionResponse {
            user_id,
            stage: AnalysisStage::Ready,
            first_chart: None,
            second_chart: None,
            updated_at: None,
            next_step: AnalysisStage::Ready.next_step(),
        },
    };

    Ok(Json(response))
}

async fn run(
    state: &AppState,
    user_id: &str,
    input: AnalysisInput,
) -> Result<Json<AnalysisOutcome>, AppError> {
    gate(state, user_id, input.action).await?;
    let outcome = state.analyzer.handle(user_id, input).await?;
    Ok(Json(outcome))
}

/// Subscription and rate-limit checks for anything that may call the model.
/// Requests without an explicit action always resolve to a model call.
async fn gate(
    state: &AppState,
    user_id: &str,
    action: Option<AnalysisAction>,
) -> Result<(), AppError> {
    if !action.map_or(true, AnalysisAction::calls_model) {
        return Ok(());
    }

    if state.config.analysis.require_subscription {
        let now = Utc::now();
        let active = state
            .keys
            .subscription(user_id)
            .await?
            .is_some_and(|s| s.is_active(now));
        if !active {
            tracing::info!(user_id = %user_id, "Analysis refused: no active subscription");
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "No active subscription. Redeem a registration key to continue."
            )));
        }
    }

    check_keyed(
        &state.analysis_limiter,
        user_id,
        "Too many analysis requests. Please wait a moment.",
    )
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(anyhow::anyhow!("Invalid multipart body: {}", e.body_text()))
    }
}

fn parse_action(raw: &str) -> Result<AnalysisAction, AppError> {
    raw.parse()
        .map_err(|e: String| AppError::BadRequest(anyhow::anyhow!(e)))
}

fn chart_image(
    state: &AppState,
    bytes: Vec<u8>,
    declared: Option<&str>,
) -> Result<ChartImage, AppError> {
    let format = check_chart_image(&bytes, declared, state.config.analysis.max_image_bytes)?;
    Ok(ChartImage {
        mime_type: format.mime_type().to_string(),
        bytes,
    })
}
