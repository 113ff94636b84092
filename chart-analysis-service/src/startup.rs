use crate::config::{ChartConfig, ProviderKind};
use crate::handlers::{self, admin, analysis, registration};
use crate::middleware::admin_session_middleware;
use crate::services::providers::{
    GeminiConfig, GeminiVisionProvider, GenerationParams, MockVisionProvider, VisionProvider,
};
use crate::services::{ChartAnalyzer, ImageFetcher, KeyStore, MemoryKeyStore, PgKeyStore, SessionStore};
use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    api_key::{api_key_middleware, ApiKeyConfig},
    metrics::metrics_middleware,
    rate_limit::{
        create_keyed_rate_limiter, create_unkeyed_rate_limiter, prune_keyed,
        rate_limit_middleware, KeyedRateLimiter,
    },
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer};

/// Login attempts allowed per minute across all clients.
const ADMIN_LOGIN_ATTEMPTS_PER_MIN: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChartConfig>,
    pub analyzer: ChartAnalyzer,
    pub keys: Arc<dyn KeyStore>,
    pub fetcher: ImageFetcher,
    pub analysis_limiter: KeyedRateLimiter,
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    /// Build from configuration: Postgres when `DATABASE_URL` is set, the
    /// configured vision provider.
    pub async fn build(config: ChartConfig) -> Result<Self, AppError> {
        let keys: Arc<dyn KeyStore> = if config.database.url.is_some() {
            let store = PgKeyStore::connect(&config.database).await.map_err(|e| {
                tracing::error!("Failed to connect to Postgres: {}", e);
                e
            })?;
            store.run_migrations().await?;
            Arc::new(store)
        } else {
            tracing::warn!("DATABASE_URL not set; registration keys are kept in memory");
            Arc::new(MemoryKeyStore::new())
        };

        let provider: Arc<dyn VisionProvider> = match config.llm.provider {
            ProviderKind::Gemini => Arc::new(GeminiVisionProvider::new(GeminiConfig {
                api_key: config.llm.api_key.clone(),
                model: config.llm.model.clone(),
                api_base: config.llm.api_base.clone(),
                timeout: Duration::from_secs(config.llm.timeout_secs),
            })?),
            ProviderKind::Mock => {
                tracing::warn!("Using the mock vision provider");
                Arc::new(MockVisionProvider::new())
            }
        };

        Self::build_with(config, provider, keys).await
    }

    /// Build with an explicit provider and key store.
    pub async fn build_with(
        config: ChartConfig,
        provider: Arc<dyn VisionProvider>,
        keys: Arc<dyn KeyStore>,
    ) -> Result<Self, AppError> {
        let config = Arc::new(config);

        let analyzer = ChartAnalyzer::new(
            provider,
            SessionStore::new(),
            GenerationParams {
                temperature: Some(config.llm.temperature),
                max_tokens: Some(config.llm.max_output_tokens),
            },
            config.analysis.max_response_chars,
        );
        let fetcher = ImageFetcher::new(
            Duration::from_secs(config.analysis.image_fetch_timeout_secs),
            config.analysis.max_image_bytes,
            config.analysis.allow_private_image_hosts,
        )?;

        let state = AppState {
            config: config.clone(),
            analyzer,
            keys,
            fetcher,
            analysis_limiter: create_keyed_rate_limiter(config.analysis.rate_limit_per_min, 60),
        };

        let app = build_router(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            provider = state.analyzer.provider().name(),
            model = state.analyzer.provider().model(),
            key_store = state.keys.backend(),
            "Listening"
        );

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let max_idle = chrono::Duration::minutes(self.state.config.analysis.session_idle_minutes);
        let eviction = self.state.analyzer.sessions().spawn_eviction(max_idle);
        let limiter_cleanup = spawn_limiter_cleanup(self.state.analysis_limiter.clone());

        let result = self.server.await;
        eviction.abort();
        limiter_cleanup.abort();
        tracing::info!("Service shutdown complete");
        result
    }
}

/// Forget per-user rate limit state once a minute so idle users do not
/// accumulate.
fn spawn_limiter_cleanup(limiter: KeyedRateLimiter) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = prune_keyed(&limiter);
            if removed > 0 {
                tracing::debug!(removed, remaining = limiter.len(), "Pruned rate limiter state");
            }
        }
    })
}

pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let api_key = ApiKeyConfig::new(
        config
            .security
            .bot_api_token
            .as_ref()
            .map(|t| t.expose_secret().clone()),
    );

    let api_routes = Router::new()
        .route("/api/analyze", post(analysis::analyze))
        .route("/api/webhook", post(analysis::webhook))
        .route("/api/reset", post(analysis::reset))
        .route("/api/session/:user_id", get(analysis::get_session))
        .route("/api/register", post(registration::register))
        .route(
            "/api/subscription/:user_id",
            get(registration::subscription),
        )
        .route_layer(from_fn_with_state(api_key, api_key_middleware));

    let login_limiter = create_unkeyed_rate_limiter(ADMIN_LOGIN_ATTEMPTS_PER_MIN, 60);
    let login_route = Router::new().route(
        "/admin/login",
        get(admin::login_page).merge(
            post(admin::login).layer(from_fn_with_state(login_limiter, rate_limit_middleware)),
        ),
    );

    let admin_routes = Router::new()
        .route("/admin", get(admin::dashboard))
        .route("/admin/logout", post(admin::logout))
        .route("/admin/keys", post(admin::create_keys))
        .route("/admin/keys/:key/revoke", post(admin::revoke_key))
        .route_layer(from_fn(admin_session_middleware));

    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(config.admin.secure_cookie)
        .with_expiry(Expiry::OnInactivity(time::Duration::hours(
            config.admin.session_hours,
        )));

    // Base64 payloads are a third larger than the image itself.
    let body_limit = config.analysis.max_image_bytes / 3 * 4 + 64 * 1024;

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .merge(api_routes)
        .merge(login_route)
        .merge(admin_routes)
        .route_layer(from_fn(metrics_middleware))
        .with_state(state)
        .layer(session_layer)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
