//! Vision model providers.
//!
//! Handlers only see the [`VisionProvider`] trait, so the Gemini backend can be
//! swapped for the mock in tests and local runs.

pub mod gemini;
pub mod mock;

use async_trait::async_trait;
use service_core::error::AppError;
use thiserror::Error;

pub use gemini::{GeminiConfig, GeminiVisionProvider};
pub use mock::MockVisionProvider;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited by the model API")]
    RateLimited,

    #[error("The model refused to analyse this image")]
    ContentFiltered,

    #[error("The model returned an empty answer")]
    EmptyResponse,

    #[error("Timed out waiting for the model")]
    Timeout,

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited => {
                AppError::TooManyRequests(err.to_string(), Some(30))
            }
            ProviderError::Timeout => AppError::GatewayTimeout(err.to_string()),
            ProviderError::NotConfigured(_) => AppError::ServiceUnavailable(err.to_string()),
            ProviderError::ApiError(_)
            | ProviderError::ContentFiltered
            | ProviderError::EmptyResponse
            | ProviderError::NetworkError(_) => AppError::BadGateway(err.to_string()),
        }
    }
}

/// An image attached to a request.
#[derive(Debug, Clone)]
pub struct ChartImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Generation parameters for a request.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

/// One model call: instructions, the user turn, and zero or more images.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub images: Vec<ChartImage>,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub finish_reason: FinishReason,
}

#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    async fn analyze(&self, request: &VisionRequest) -> Result<ProviderResponse, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}
