//! Mock provider for tests and `LLM_PROVIDER=mock`.

use super::{FinishReason, ProviderError, ProviderResponse, VisionProvider, VisionRequest};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

enum Reply {
    /// Echo a short summary of the request.
    Echo,
    Canned(String),
    Fail(fn() -> ProviderError),
}

pub struct MockVisionProvider {
    reply: Reply,
    calls: AtomicUsize,
    last_request: Mutex<Option<VisionRequest>>,
}

impl MockVisionProvider {
    pub fn new() -> Self {
        Self::with_reply(Reply::Echo)
    }

    /// Always answer with `text`.
    pub fn canned(text: impl Into<String>) -> Self {
        Self::with_reply(Reply::Canned(text.into()))
    }

    /// Always fail with the error `make_error` builds.
    pub fn failing(make_error: fn() -> ProviderError) -> Self {
        Self::with_reply(Reply::Fail(make_error))
    }

    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<VisionRequest> {
        self.last_request.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Default for MockVisionProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisionProvider for MockVisionProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-vision"
    }

    async fn analyze(&self, request: &VisionRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut guard) = self.last_request.lock() {
            *guard = Some(request.clone());
        }

        let text = match &self.reply {
            Reply::Fail(make_error) => return Err(make_error()),
            Reply::Canned(text) => text.clone(),
            Reply::Echo => format!(
                "Mock analysis of {} image(s).\n\n{}",
                request.images.len(),
                request.prompt
            ),
        };

        Ok(ProviderResponse {
            input_tokens: request.prompt.len() as i32 / 4,
            output_tokens: text.len() as i32 / 4,
            text,
            finish_reason: FinishReason::Complete,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match &self.reply {
            Reply::Fail(make_error) => Err(make_error()),
            _ => Ok(()),
        }
    }
}
