//! Admin panel: login, key dashboard, issuing and revoking keys.

use crate::dtos::{CreateKeysForm, DashboardQuery, KeyRow, LoginForm};
use crate::models::{KeyFilter, KeyStats, NewKeyBatch};
use crate::services::metrics;
use crate::startup::AppState;
use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use chrono::Utc;
use service_core::error::AppError;
use tower_sessions::Session;
use validator::Validate;

pub const ADMIN_SESSION_KEY: &str = "admin_user";
const FLASH_KEY: &str = "flash";
const CREATED_KEYS_KEY: &str = "created_keys";
const PAGE_SIZE: i64 = 50;

#[derive(Template)]
#[template(path = "admin/login.html")]
struct LoginTemplate {
    error: String,
}

struct FilterLink {
    name: &'static str,
    current: bool,
}

#[derive(Template)]
#[template(path = "admin/dashboard.html")]
struct DashboardTemplate {
    username: String,
    stats: KeyStats,
    rows: Vec<KeyRow>,
    filter: &'static str,
    filters: Vec<FilterLink>,
    page: u32,
    prev_page: u32,
    has_prev: bool,
    has_next: bool,
    flash: String,
    created: Vec<String>,
    default_prefix: String,
}

fn render<T: Template>(template: &T) -> Result<Html<String>, AppError> {
    template
        .render()
        .map(Html)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Template error: {}", e)))
}

fn session_error(e: tower_sessions::session::Error) -> AppError {
    AppError::InternalError(anyhow::anyhow!("Session error: {}", e))
}

async fn set_flash(session: &Session, message: impl Into<String>) -> Result<(), AppError> {
    session
        .insert(FLASH_KEY, message.into())
        .await
        .map_err(session_error)
}

/// `GET /admin/login`
pub async fn login_page() -> Result<Html<String>, AppError> {
    render(&LoginTemplate {
        error: String::new(),
    })
}

/// `POST /admin/login`
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<LoginForm>,
) -> Result<Response, AppError> {
    let admin = &state.config.admin;
    // Always run the hash check so timing does not reveal a valid username.
    let password_ok = admin.password_hash.verify(&form.password);
    let username_ok = form.username.trim() == admin.username;

    if !(password_ok && username_ok) {
        tracing::warn!(username = %form.username, "Admin login failed");
        let page = render(&LoginTemplate {
            error: "Invalid username or password".to_string(),
        })?;
        return Ok((StatusCode::UNAUTHORIZED, page).into_response());
    }

    session.cycle_id().await.map_err(session_error)?;
    session
        .insert(ADMIN_SESSION_KEY, admin.username.clone())
        .await
        .map_err(session_error)?;

    tracing::info!(username = %admin.username, "Admin logged in");
    Ok(Redirect::to("/admin").into_response())
}

/// `POST /admin/logout`
pub async fn logout(session: Session) -> Result<Redirect, AppError> {
    session.flush().await.map_err(session_error)?;
    Ok(Redirect::to("/admin/login"))
}

/// `GET /admin`
pub async fn dashboard(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<DashboardQuery>,
) -> Result<Html<String>, AppError> {
    let now = Utc::now();
    let page = query.page.unwrap_or(1).max(1);
    let offset = i64::from(page - 1) * PAGE_SIZE;

    let stats = state.keys.key_stats(now).await?;
    // One extra row tells us whether there is a next page.
    let mut keys = state
        .keys
        .list_keys(query.filter, PAGE_SIZE + 1, offset, now)
        .await?;
    let has_next = keys.len() as i64 > PAGE_SIZE;
    keys.truncate(PAGE_SIZE as usize);

    let username: String = session
        .get(ADMIN_SESSION_KEY)
        .await
        .map_err(session_error)?
        .unwrap_or_default();
    let flash: String = session
        .remove(FLASH_KEY)
        .await
        .map_err(session_error)?
        .unwrap_or_default();
    let created: Vec<String> = session
        .remove(CREATED_KEYS_KEY)
        .await
        .map_err(session_error)?
        .unwrap_or_default();

    render(&DashboardTemplate {
        username,
        stats,
        rows: keys.iter().map(|k| KeyRow::from_key(k, now)).collect(),
        filter: query.filter.as_str(),
        filters: [
            KeyFilter::All,
            KeyFilter::Unused,
            KeyFilter::Active,
            KeyFilter::Expired,
            KeyFilter::Revoked,
        ]
        .into_iter()
        .map(|f| FilterLink {
            name: f.as_str(),
            current: f == query.filter,
        })
        .collect(),
        page,
        prev_page: page.saturating_sub(1).max(1),
        has_prev: page > 1,
        has_next,
        flash,
        created,
        default_prefix: state.config.admin.key_prefix.clone(),
    })
}

/// `POST /admin/keys`
pub async fn create_keys(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<CreateKeysForm>,
) -> Result<Redirect, AppError> {
    if let Err(e) = form.validate() {
        set_flash(&session, format!("Keys not created: {}", e)).await?;
        return Ok(Redirect::to("/admin"));
    }

    let note = form
        .note
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    let batch = NewKeyBatch {
        count: form.count,
        duration_days: form.duration_days,
        note,
        prefix: state.config.admin.key_prefix.clone(),
    };

    let created = state.keys.create_keys(&batch).await?;
    metrics::record_keys_issued(created.len());
    tracing::info!(
        count = created.len(),
        duration_days = batch.duration_days,
        "Registration keys issued"
    );

    let values: Vec<String> = created.into_iter().map(|k| k.key).collect();
    set_flash(
        &session,
        format!(
            "Created {} key(s) valid for {} day(s).",
            values.len(),
            batch.duration_days
        ),
    )
    .await?;
    session
        .insert(CREATED_KEYS_KEY, values)
        .await
        .map_err(session_error)?;

    Ok(Redirect::to("/admin"))
}

/// `POST /admin/keys/:key/revoke`
pub async fn revoke_key(
    State(state): State<AppState>,
    session: Session,
    Path(key): Path<String>,
) -> Result<Redirect, AppError> {
    let revoked = state.keys.revoke_key(&key, Utc::now()).await?;
    tracing::info!(key = %revoked.key, "Registration key revoked");
    set_flash(&session, format!("Key {} revoked.", revoked.key)).await?;
    Ok(Redirect::to("/admin"))
}
