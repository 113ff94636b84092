mod common;

use chart_analysis_service::models::{KeyFilter, KeyStatus};
use chart_analysis_service::services::KeyStore;
use chrono::Utc;
use common::{TestApp, ADMIN_USERNAME};
use serde_json::json;

fn location(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[tokio::test]
async fn dashboard_redirects_without_session() {
    let app = TestApp::spawn().await;
    let client = app.admin_client();

    let response = client
        .get(app.url("/admin"))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(location(&response).as_deref(), Some("/admin/login"));

    let create = client
        .post(app.url("/admin/keys"))
        .form(&[("count", "5"), ("duration_days", "30")])
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(create.status().as_u16(), 303);
    assert_eq!(app.keys.key_stats(Utc::now()).await.unwrap().total, 0);
}

#[tokio::test]
async fn login_page_renders() {
    let app = TestApp::spawn().await;

    let response = app
        .admin_client()
        .get(app.url("/admin/login"))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 200);
    assert!(response
        .headers()
        .get("content-security-policy")
        .is_some());
    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains("<form method=\"post\" action=\"/admin/login\">"));
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let app = TestApp::spawn().await;
    let client = app.admin_client();

    let response = client
        .post(app.url("/admin/login"))
        .form(&[("username", ADMIN_USERNAME), ("password", "hunter2")])
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 401);
    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains("Invalid username or password"));

    let dashboard = client
        .get(app.url("/admin"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(dashboard.status().as_u16(), 303);
}

#[tokio::test]
async fn issue_keys_and_show_them_once() {
    let app = TestApp::spawn().await;
    let client = app.admin_login().await;

    let response = client
        .post(app.url("/admin/keys"))
        .form(&[("count", "3"), ("duration_days", "14"), ("note", "promo")])
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(location(&response).as_deref(), Some("/admin"));

    let keys = app
        .keys
        .list_keys(KeyFilter::All, 10, 0, Utc::now())
        .await
        .unwrap();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| k.key.starts_with("TST-")));
    assert!(keys.iter().all(|k| k.duration_days == 14));
    assert!(keys.iter().all(|k| k.note.as_deref() == Some("promo")));

    let dashboard = client
        .get(app.url("/admin"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(dashboard.status().as_u16(), 200);
    let body = dashboard.text().await.expect("Failed to read body");
    assert!(body.contains("Created 3 key(s) valid for 14 day(s)."));
    assert!(body.contains("id=\"created-keys\""));
    for key in &keys {
        assert!(body.contains(&key.key));
    }

    // The flash and the new-key list are shown once.
    let again = client
        .get(app.url("/admin"))
        .send()
        .await
        .expect("Failed to execute request")
        .text()
        .await
        .expect("Failed to read body");
    assert!(!again.contains("Created 3 key(s)"));
    assert!(!again.contains("id=\"created-keys\""));
}

#[tokio::test]
async fn invalid_batch_is_refused() {
    let app = TestApp::spawn().await;
    let client = app.admin_login().await;

    let response = client
        .post(app.url("/admin/keys"))
        .form(&[("count", "0"), ("duration_days", "30")])
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 303);

    let body = client
        .get(app.url("/admin"))
        .send()
        .await
        .expect("Failed to execute request")
        .text()
        .await
        .expect("Failed to read body");
    assert!(body.contains("Keys not created"));
    assert_eq!(app.keys.key_stats(Utc::now()).await.unwrap().total, 0);
}

#[tokio::test]
async fn revoked_key_cannot_be_redeemed() {
    let app = TestApp::spawn().await;
    app.seed_key("TST-REVO-KEME-0001", 30).await;
    let client = app.admin_login().await;

    let response = client
        .post(app.url("/admin/keys/TST-REVO-KEME-0001/revoke"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 303);

    let revoked = app
        .keys
        .list_keys(KeyFilter::Revoked, 10, 0, Utc::now())
        .await
        .unwrap();
    assert_eq!(revoked.len(), 1);
    assert_eq!(revoked[0].status(Utc::now()), KeyStatus::Revoked);

    let redeem = app
        .post_api(
            "/api/register",
            &json!({ "user_id": "pat", "key": "TST-REVO-KEME-0001" }),
        )
        .await;
    assert_eq!(redeem.status().as_u16(), 409);

    let filtered = client
        .get(app.url("/admin?filter=revoked"))
        .send()
        .await
        .expect("Failed to execute request")
        .text()
        .await
        .expect("Failed to read body");
    assert!(filtered.contains("TST-REVO-KEME-0001"));
    assert!(filtered.contains("Key TST-REVO-KEME-0001 revoked."));
}

#[tokio::test]
async fn revoking_unknown_key_is_not_found() {
    let app = TestApp::spawn().await;
    let client = app.admin_login().await;

    let response = client
        .post(app.url("/admin/keys/TST-MISSING/revoke"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn logout_ends_session() {
    let app = TestApp::spawn().await;
    let client = app.admin_login().await;

    let dashboard = client
        .get(app.url("/admin"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(dashboard.status().as_u16(), 200);

    let logout = client
        .post(app.url("/admin/logout"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(logout.status().as_u16(), 303);

    let after = client
        .get(app.url("/admin"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(after.status().as_u16(), 303);
}
