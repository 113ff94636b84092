use crate::utils::password::AdminPasswordHash;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

/// Telegram caps a message at 4096 characters; leave room for the bot's own framing.
const DEFAULT_MAX_RESPONSE_CHARS: usize = 4000;
const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ChartConfig {
    pub common: core_config::Config,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub analysis: AnalysisConfig,
    pub security: SecurityConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Without a URL the service keeps keys in memory (dev only).
    pub url: Option<Secret<String>>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    Mock,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ProviderKind::Gemini),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(format!("unknown LLM provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub api_key: Secret<String>,
    pub model: String,
    pub api_base: String,
    pub timeout_secs: u64,
    pub max_output_tokens: i32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub max_response_chars: usize,
    pub max_image_bytes: usize,
    pub image_fetch_timeout_secs: u64,
    /// Let webhook image URLs point at loopback or private addresses.
    pub allow_private_image_hosts: bool,
    pub session_idle_minutes: i64,
    pub rate_limit_per_min: u32,
    pub require_subscription: bool,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Shared secret the bot sends in `X-Bot-Token`. Unset disables the check.
    pub bot_api_token: Option<Secret<String>>,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub username: String,
    pub password_hash: AdminPasswordHash,
    pub session_hours: i64,
    /// Mark the admin session cookie `Secure` (HTTPS only).
    pub secure_cookie: bool,
    pub key_prefix: String,
}

impl ChartConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let database_url = if is_prod {
            Some(get_env("DATABASE_URL", None, is_prod)?)
        } else {
            optional_env("DATABASE_URL")
        };

        let provider: ProviderKind = parse_env("LLM_PROVIDER", ProviderKind::Gemini)?;
        if is_prod && provider == ProviderKind::Mock {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LLM_PROVIDER=mock is not allowed in production"
            )));
        }
        let api_key = match provider {
            ProviderKind::Gemini => get_env("GOOGLE_API_KEY", None, is_prod)?,
            ProviderKind::Mock => optional_env("GOOGLE_API_KEY").unwrap_or_default(),
        };

        Ok(ChartConfig {
            common: common_config,
            database: DatabaseConfig {
                url: database_url.map(Secret::new),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 1)?,
            },
            llm: LlmConfig {
                provider,
                api_key: Secret::new(api_key),
                model: get_env("GEMINI_MODEL", Some("gemini-2.0-flash"), false)?,
                api_base: get_env(
                    "GEMINI_API_BASE",
                    Some("https://generativelanguage.googleapis.com/v1beta"),
                    false,
                )?,
                timeout_secs: parse_env("LLM_TIMEOUT_SECS", 90)?,
                max_output_tokens: parse_env("LLM_MAX_OUTPUT_TOKENS", 2048)?,
                temperature: parse_env("LLM_TEMPERATURE", 0.4)?,
            },
            analysis: AnalysisConfig {
                max_response_chars: parse_env("MAX_RESPONSE_CHARS", DEFAULT_MAX_RESPONSE_CHARS)?,
                max_image_bytes: parse_env("MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES)?,
                image_fetch_timeout_secs: parse_env("IMAGE_FETCH_TIMEOUT_SECS", 15)?,
                allow_private_image_hosts: parse_env("ALLOW_PRIVATE_IMAGE_HOSTS", false)?,
                session_idle_minutes: parse_env("SESSION_IDLE_MINUTES", 120)?,
                rate_limit_per_min: parse_env("ANALYSIS_RATE_LIMIT_PER_MIN", 6)?,
                require_subscription: parse_env("REQUIRE_SUBSCRIPTION", true)?,
            },
            security: SecurityConfig {
                bot_api_token: optional_env("BOT_API_TOKEN").map(Secret::new),
            },
            admin: AdminConfig {
                username: get_env("ADMIN_USERNAME", Some("admin"), is_prod)?,
                password_hash: admin_password_hash(is_prod)?,
                session_hours: parse_env("ADMIN_SESSION_HOURS", 8)?,
                secure_cookie: parse_env("ADMIN_SECURE_COOKIE", is_prod)?,
                key_prefix: get_env("KEY_PREFIX", Some("TRD"), false)?,
            },
        })
    }
}

/// `ADMIN_PASSWORD_HASH` (PHC string) wins; a plaintext `ADMIN_PASSWORD` is
/// accepted outside production and hashed at startup.
fn admin_password_hash(is_prod: bool) -> Result<AdminPasswordHash, AppError> {
    if let Some(phc) = optional_env("ADMIN_PASSWORD_HASH") {
        return AdminPasswordHash::parse(phc).map_err(AppError::ConfigError);
    }
    if !is_prod {
        if let Some(plain) = optional_env("ADMIN_PASSWORD") {
            tracing::warn!("Using plaintext ADMIN_PASSWORD; set ADMIN_PASSWORD_HASH instead");
            return AdminPasswordHash::from_plaintext(&plain).map_err(AppError::ConfigError);
        }
    }
    Err(AppError::ConfigError(anyhow::anyhow!(
        "ADMIN_PASSWORD_HASH is required but not set"
    )))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        None => Ok(default),
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}
