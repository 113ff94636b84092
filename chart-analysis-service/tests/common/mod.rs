//! Test helpers for chart-analysis-service integration tests.
//!
//! Every app runs on a random port with the mock vision provider and the
//! in-memory key store, so no external services are needed.

#![allow(dead_code)]

use chart_analysis_service::config::{
    AdminConfig, AnalysisConfig, ChartConfig, DatabaseConfig, LlmConfig, ProviderKind,
    SecurityConfig,
};
use chart_analysis_service::models::RegistrationKey;
use chart_analysis_service::services::providers::MockVisionProvider;
use chart_analysis_service::services::{KeyStore, MemoryKeyStore, SessionStore};
use chart_analysis_service::startup::Application;
use chart_analysis_service::utils::password::AdminPasswordHash;
use chrono::Utc;
use reqwest::redirect::Policy;
use reqwest::Client;
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use std::sync::Arc;

pub const BOT_TOKEN: &str = "test-bot-token";
pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "correct horse battery staple";

/// What the mock model answers for every chart.
pub const CANNED_ANALYSIS: &str = "**BTCUSDT H4**\n\nTrend: bullish above 64000 support.\n\nPlan: wait for a pullback into the H4 demand zone.";

/// Smallest valid 1x1 PNG.
pub const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

pub fn test_config() -> ChartConfig {
    ChartConfig {
        common: CoreConfig {
            port: 0,
            ..CoreConfig::default()
        },
        database: DatabaseConfig {
            url: None,
            max_connections: 2,
            min_connections: 0,
        },
        llm: LlmConfig {
            provider: ProviderKind::Mock,
            api_key: Secret::new(String::new()),
            model: "mock-vision".to_string(),
            api_base: "http://127.0.0.1:1".to_string(),
            timeout_secs: 5,
            max_output_tokens: 1024,
            temperature: 0.2,
        },
        analysis: AnalysisConfig {
            max_response_chars: 4000,
            max_image_bytes: 1024 * 1024,
            image_fetch_timeout_secs: 5,
            // The wiremock image host listens on 127.0.0.1.
            allow_private_image_hosts: true,
            session_idle_minutes: 60,
            rate_limit_per_min: 100,
            require_subscription: true,
        },
        security: SecurityConfig {
            bot_api_token: Some(Secret::new(BOT_TOKEN.to_string())),
        },
        admin: AdminConfig {
            username: ADMIN_USERNAME.to_string(),
            password_hash: AdminPasswordHash::from_plaintext(ADMIN_PASSWORD)
                .expect("Failed to hash admin password"),
            session_hours: 1,
            secure_cookie: false,
            key_prefix: "TST".to_string(),
        },
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub provider: Arc<MockVisionProvider>,
    pub keys: Arc<MemoryKeyStore>,
    pub sessions: SessionStore,
    pub client: Client,
}

impl TestApp {
    /// Spawn with default settings and a canned model answer.
    pub async fn spawn() -> Self {
        Self::spawn_with(MockVisionProvider::canned(CANNED_ANALYSIS), |_| {}).await
    }

    /// Spawn with a specific provider and config tweaks.
    pub async fn spawn_with(
        provider: MockVisionProvider,
        configure: impl FnOnce(&mut ChartConfig),
    ) -> Self {
        let mut config = test_config();
        configure(&mut config);

        let provider = Arc::new(provider);
        let keys = Arc::new(MemoryKeyStore::new());

        let app = Application::build_with(config, provider.clone(), keys.clone())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let sessions = app.state().analyzer.sessions().clone();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = Client::new();
        for _ in 0..50 {
            if client.get(format!("{}/health", address)).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            provider,
            keys,
            sessions,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// POST JSON to a bot endpoint with the bot token attached.
    pub async fn post_api(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("x-bot-token", BOT_TOKEN)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_api(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("x-bot-token", BOT_TOKEN)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Upload a chart through the multipart endpoint.
    pub async fn upload_chart(
        &self,
        user_id: &str,
        action: Option<&str>,
        caption: Option<&str>,
    ) -> reqwest::Response {
        let image = reqwest::multipart::Part::bytes(PNG_1X1.to_vec())
            .file_name("chart.png")
            .mime_str("image/png")
            .expect("Invalid mime type");
        let mut form = reqwest::multipart::Form::new()
            .text("user_id", user_id.to_string())
            .part("image", image);
        if let Some(action) = action {
            form = form.text("action", action.to_string());
        }
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        self.client
            .post(self.url("/api/analyze"))
            .header("x-bot-token", BOT_TOKEN)
            .multipart(form)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Put an unused key straight into the store.
    pub async fn seed_key(&self, key: &str, days: i32) {
        self.keys
            .insert(RegistrationKey::new(key.to_string(), days, None, Utc::now()))
            .await;
    }

    /// Give `user_id` an active subscription.
    pub async fn grant_access(&self, user_id: &str) {
        let key = format!("SEED-{}", user_id.to_uppercase());
        self.seed_key(&key, 30).await;
        self.keys
            .redeem_key(&key, user_id, Utc::now())
            .await
            .expect("Failed to redeem seeded key");
    }

    /// A client that keeps cookies and does not follow redirects.
    pub fn admin_client(&self) -> Client {
        Client::builder()
            .cookie_store(true)
            .redirect(Policy::none())
            .build()
            .expect("Failed to build admin client")
    }

    /// Log in and return the cookie-carrying client.
    pub async fn admin_login(&self) -> Client {
        let client = self.admin_client();
        let response = client
            .post(self.url("/admin/login"))
            .form(&[("username", ADMIN_USERNAME), ("password", ADMIN_PASSWORD)])
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 303);
        client
    }
}
