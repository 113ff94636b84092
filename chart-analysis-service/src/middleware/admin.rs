use crate::handlers::admin::ADMIN_SESSION_KEY;
use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tower_sessions::Session;

/// Send anyone without an admin session to the login page.
pub async fn admin_session_middleware(session: Session, request: Request, next: Next) -> Response {
    let admin: Option<String> = session.get(ADMIN_SESSION_KEY).await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to read admin session");
        None
    });

    if admin.is_none() {
        return Redirect::to("/admin/login").into_response();
    }

    next.run(request).await
}
