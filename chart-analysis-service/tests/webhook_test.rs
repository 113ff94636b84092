mod common;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{TestApp, PNG_1X1};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn webhook_downloads_image_by_url() {
    let app = TestApp::spawn().await;
    app.grant_access("quinn").await;

    let host = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/charts/eurusd.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(PNG_1X1.to_vec()),
        )
        .expect(1)
        .mount(&host)
        .await;

    let response = app
        .post_api(
            "/api/webhook",
            &json!({
                "user_id": "quinn",
                "text": "EURUSD daily",
                "image_url": format!("{}/charts/eurusd.png", host.uri()),
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["action"], "first_chart");
    assert_eq!(body["stage"], "first_done");

    let request = app.provider.last_request().expect("no request recorded");
    assert_eq!(request.images.len(), 1);
    assert_eq!(request.images[0].mime_type, "image/png");
    assert_eq!(request.images[0].bytes, PNG_1X1);
}

#[tokio::test]
async fn webhook_accepts_inline_base64() {
    let app = TestApp::spawn().await;
    app.grant_access("rosa").await;

    let response = app
        .post_api(
            "/api/webhook",
            &json!({
                "user_id": "rosa",
                "action": "quick",
                "image_base64": STANDARD.encode(PNG_1X1),
                "mime_type": "image/png",
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["action"], "quick");
    // Quick reads do not move the sequence forward.
    assert_eq!(body["stage"], "ready");
}

#[tokio::test]
async fn webhook_rejects_both_image_sources() {
    let app = TestApp::spawn().await;
    app.grant_access("sam").await;

    let response = app
        .post_api(
            "/api/webhook",
            &json!({
                "user_id": "sam",
                "image_url": "https://cdn.example.com/chart.png",
                "image_base64": STANDARD.encode(PNG_1X1),
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(app.provider.calls(), 0);
}

#[tokio::test]
async fn webhook_rejects_bad_base64() {
    let app = TestApp::spawn().await;
    app.grant_access("tara").await;

    let response = app
        .post_api(
            "/api/webhook",
            &json!({ "user_id": "tara", "image_base64": "%%% not base64 %%%" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn webhook_reports_image_host_failure() {
    let app = TestApp::spawn().await;
    app.grant_access("uma").await;

    let host = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&host)
        .await;

    let response = app
        .post_api(
            "/api/webhook",
            &json!({ "user_id": "uma", "image_url": format!("{}/gone.png", host.uri()) }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 502);
    assert_eq!(app.provider.calls(), 0);
}

#[tokio::test]
async fn webhook_checks_subscription_before_download() {
    let app = TestApp::spawn().await;

    let host = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG_1X1.to_vec()))
        .expect(0)
        .mount(&host)
        .await;

    let response = app
        .post_api(
            "/api/webhook",
            &json!({ "user_id": "victor", "image_url": format!("{}/chart.png", host.uri()) }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test]
async fn webhook_rejects_non_http_urls() {
    let app = TestApp::spawn().await;
    app.grant_access("wade").await;

    let response = app
        .post_api(
            "/api/webhook",
            &json!({ "user_id": "wade", "image_url": "file:///etc/passwd" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn webhook_without_content_is_rejected() {
    let app = TestApp::spawn().await;
    app.grant_access("xena").await;

    let response = app
        .post_api("/api/webhook", &json!({ "user_id": "xena" }))
        .await;

    assert_eq!(response.status().as_u16(), 400);
}
