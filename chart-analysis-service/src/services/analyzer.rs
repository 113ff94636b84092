//! Orchestrates one analysis request: session transition, prompt, model call,
//! and post-processing of the answer.

use crate::models::{AnalysisAction, AnalysisStage, ChartRecord, TransitionError, UserSession};
use crate::prompts::PromptSet;
use crate::services::metrics;
use crate::services::providers::{
    ChartImage, FinishReason, GenerationParams, VisionProvider, VisionRequest,
};
use crate::services::sessions::SessionStore;
use crate::utils::{
    detect_instrument, detect_timeframe, tidy_response, truncate_for_message, Instrument,
    Timeframe,
};
use chrono::Utc;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// What a request carries after transport-level parsing.
#[derive(Debug, Default)]
pub struct AnalysisInput {
    pub action: Option<AnalysisAction>,
    pub text: Option<String>,
    pub image: Option<ChartImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub user_id: String,
    pub action: AnalysisAction,
    pub stage: AnalysisStage,
    pub message: String,
    pub timeframe: Option<Timeframe>,
    pub instrument: Option<Instrument>,
    pub warnings: Vec<String>,
    pub truncated: bool,
    pub next_step: &'static str,
}

#[derive(Clone)]
pub struct ChartAnalyzer {
    provider: Arc<dyn VisionProvider>,
    sessions: SessionStore,
    params: GenerationParams,
    max_response_chars: usize,
}

impl ChartAnalyzer {
    pub fn new(
        provider: Arc<dyn VisionProvider>,
        sessions: SessionStore,
        params: GenerationParams,
        max_response_chars: usize,
    ) -> Self {
        Self {
            provider,
            sessions,
            params,
            max_response_chars,
        }
    }

    pub fn provider(&self) -> &Arc<dyn VisionProvider> {
        &self.provider
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[instrument(skip(self, input), fields(action = tracing::field::Empty))]
    pub async fn handle(
        &self,
        user_id: &str,
        input: AnalysisInput,
    ) -> Result<AnalysisOutcome, AppError> {
        // Quick reads bypass the session store entirely.
        if input.action == Some(AnalysisAction::Quick) {
            tracing::Span::current().record("action", AnalysisAction::Quick.as_str());
            let mut scratch = UserSession::new(Utc::now());
            return self
                .run_step(user_id, AnalysisAction::Quick, &input, &mut scratch)
                .await;
        }

        // Held across the model call so one user's requests never interleave.
        let mut session = self.sessions.lock(user_id).await;

        let action = session.resolve_action(
            input.action,
            input.image.is_some(),
            has_text(&input.text),
        )?;
        tracing::Span::current().record("action", action.as_str());

        match action {
            AnalysisAction::Reset => {
                session.reset(Utc::now());
                metrics::record_analysis(action.as_str(), "ok");
                Ok(self.outcome(
                    user_id,
                    action,
                    &session,
                    "Session reset. Send a higher-timeframe chart to start a new analysis."
                        .to_string(),
                ))
            }
            AnalysisAction::Status => {
                let message = describe(&session);
                Ok(self.outcome(user_id, action, &session, message))
            }
            _ => self.run_step(user_id, action, &input, &mut session).await,
        }
    }

    /// Validate, prompt the model and fold the answer into `session`.
    async fn run_step(
        &self,
        user_id: &str,
        action: AnalysisAction,
        input: &AnalysisInput,
        session: &mut UserSession,
    ) -> Result<AnalysisOutcome, AppError> {
        if let Err(e) = check_input(action, input).and_then(|_| session.check(action)) {
            metrics::record_analysis(action.as_str(), "rejected");
            return Err(e.into());
        }

        let caption = input.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let prompt = PromptSet::for_step(action, session, caption).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("no prompt for action {}", action))
        })?;

        let images = match (&input.image, prompt.with_image) {
            (Some(image), true) => vec![image.clone()],
            _ => Vec::new(),
        };

        let request = VisionRequest {
            system_prompt: prompt.system.to_string(),
            prompt: prompt.user,
            images,
            params: self.params.clone(),
        };

        let started = Instant::now();
        let result = self.provider.analyze(&request).await;
        let elapsed = started.elapsed().as_secs_f64();

        let response = match result {
            Ok(response) => {
                metrics::record_llm_call(self.provider.name(), "ok", elapsed);
                metrics::record_llm_tokens(
                    self.provider.name(),
                    response.input_tokens,
                    response.output_tokens,
                );
                response
            }
            Err(e) => {
                metrics::record_llm_call(self.provider.name(), "error", elapsed);
                metrics::record_analysis(action.as_str(), "error");
                tracing::warn!(
                    user_id = %user_id,
                    provider = self.provider.name(),
                    error = %e,
                    "Vision model call failed"
                );
                return Err(e.into());
            }
        };

        let text = tidy_response(&response.text);
        // The user's caption wins; the answer only fills in what it lacks.
        let timeframe = caption
            .and_then(detect_timeframe)
            .or_else(|| detect_timeframe(&text));
        let instrument = caption
            .and_then(detect_instrument)
            .or_else(|| detect_instrument(&text));

        let mut warnings = Vec::new();
        if response.finish_reason == FinishReason::Length {
            warnings.push("The model hit its output limit; the analysis may be incomplete.".to_string());
        }
        if action == AnalysisAction::SecondChart {
            warnings.extend(consistency_warnings(
                session.first.as_ref(),
                timeframe,
                instrument.as_ref(),
            ));
        }

        let now = Utc::now();
        let record = ChartRecord {
            analysis: text.clone(),
            timeframe,
            instrument: instrument.clone(),
            analyzed_at: now,
        };

        match action {
            AnalysisAction::FirstChart => session.record_first(record),
            AnalysisAction::SecondChart => session.record_second(record),
            AnalysisAction::Feedback => session.record_feedback(text.clone(), now),
            _ => {}
        }

        let shaped = truncate_for_message(&text, self.max_response_chars);
        metrics::record_analysis(action.as_str(), "ok");

        tracing::info!(
            user_id = %user_id,
            stage = %session.stage,
            timeframe = ?timeframe,
            instrument = ?instrument,
            truncated = shaped.truncated,
            latency_secs = elapsed,
            "Analysis completed"
        );

        Ok(AnalysisOutcome {
            user_id: user_id.to_string(),
            action,
            stage: session.stage,
            message: shaped.text,
            timeframe,
            instrument,
            warnings,
            truncated: shaped.truncated,
            next_step: next_step_for(action, session.stage),
        })
    }

    fn outcome(
        &self,
        user_id: &str,
        action: AnalysisAction,
        session: &UserSession,
        message: String,
    ) -> AnalysisOutcome {
        let latest = session.second.as_ref().or(session.first.as_ref());
        AnalysisOutcome {
            user_id: user_id.to_string(),
            action,
            stage: session.stage,
            message,
            timeframe: latest.and_then(|r| r.timeframe),
            instrument: latest.and_then(|r| r.instrument.clone()),
            warnings: Vec::new(),
            truncated: false,
            next_step: session.stage.next_step(),
        }
    }
}

fn has_text(text: &Option<String>) -> bool {
    text.as_deref().is_some_and(|t| !t.trim().is_empty())
}

fn check_input(action: AnalysisAction, input: &AnalysisInput) -> Result<(), TransitionError> {
    if action.requires_image() && input.image.is_none() {
        return Err(TransitionError::ImageRequired(action));
    }
    if action == AnalysisAction::Feedback && !has_text(&input.text) {
        return Err(TransitionError::TextRequired);
    }
    Ok(())
}

/// Quick analyses leave the session alone, so the hint is about the session's
/// own stage only for sequence actions.
fn next_step_for(action: AnalysisAction, stage: AnalysisStage) -> &'static str {
    match action {
        AnalysisAction::Quick => "Send another chart for a quick read, or start the two-chart analysis.",
        _ => stage.next_step(),
    }
}

fn describe(session: &UserSession) -> String {
    let chart = |label: &str, record: Option<&ChartRecord>| match record {
        Some(r) => {
            let instrument = r
                .instrument
                .as_ref()
                .map(|i| i.to_string())
                .unwrap_or_else(|| "unknown instrument".to_string());
            let timeframe = r
                .timeframe
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unknown timeframe".to_string());
            format!("{}: {} {}", label, instrument, timeframe)
        }
        None => format!("{}: not analysed yet", label),
    };

    format!(
        "Current stage: {}.\n{}\n{}",
        session.stage,
        chart("First chart", session.first.as_ref()),
        chart("Second chart", session.second.as_ref())
    )
}

/// The second chart should be a lower timeframe of the same instrument.
fn consistency_warnings(
    first: Option<&ChartRecord>,
    timeframe: Option<Timeframe>,
    instrument: Option<&Instrument>,
) -> Vec<String> {
    let Some(first) = first else {
        return Vec::new();
    };
    let mut warnings = Vec::new();

    if let (Some(higher), Some(lower)) = (first.timeframe, timeframe) {
        if lower >= higher {
            warnings.push(format!(
                "The second chart ({}) is not a lower timeframe than the first ({}).",
                lower, higher
            ));
        }
    }
    if let (Some(a), Some(b)) = (first.instrument.as_ref(), instrument) {
        if a != b {
            warnings.push(format!(
                "The second chart shows {} but the first showed {}.",
                b, a
            ));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::{MockVisionProvider, ProviderError};

    fn png() -> ChartImage {
        ChartImage {
            mime_type: "image/png".into(),
            bytes: vec![1, 2, 3],
        }
    }

    fn analyzer(provider: MockVisionProvider, max_chars: usize) -> (ChartAnalyzer, Arc<MockVisionProvider>) {
        let provider = Arc::new(provider);
        let analyzer = ChartAnalyzer::new(
            provider.clone(),
            SessionStore::new(),
            GenerationParams::default(),
            max_chars,
        );
        (analyzer, provider)
    }

    fn chart(text: Option<&str>) -> AnalysisInput {
        AnalysisInput {
            action: None,
            text: text.map(str::to_string),
            image: Some(png()),
        }
    }

    #[tokio::test]
    async fn test_full_sequence() {
        let (analyzer, provider) = analyzer(MockVisionProvider::canned("EURUSD H4: bullish structure."), 4000);

        let first = analyzer.handle("u", chart(Some("EURUSD H4"))).await.unwrap();
        assert_eq!(first.action, AnalysisAction::FirstChart);
        assert_eq!(first.stage, AnalysisStage::FirstDone);
        assert_eq!(first.timeframe, Some(Timeframe::H4));
        assert_eq!(first.instrument.as_ref().map(|i| i.symbol()), Some("EUR/USD"));

        let second = analyzer.handle("u", chart(Some("M15"))).await.unwrap();
        assert_eq!(second.action, AnalysisAction::SecondChart);
        assert_eq!(second.stage, AnalysisStage::BothDone);

        let feedback = analyzer
            .handle(
                "u",
                AnalysisInput {
                    text: Some("I plan to buy the dip".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(feedback.action, AnalysisAction::Feedback);
        assert_eq!(feedback.stage, AnalysisStage::Completed);
        assert_eq!(provider.calls(), 3);
        assert!(provider.last_request().unwrap().images.is_empty());
    }

    #[tokio::test]
    async fn test_feedback_before_charts_is_conflict() {
        let (analyzer, provider) = analyzer(MockVisionProvider::new(), 4000);
        let err = analyzer
            .handle(
                "u",
                AnalysisInput {
                    text: Some("thoughts?".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_call_leaves_session_unchanged() {
        let (analyzer, _) = analyzer(MockVisionProvider::failing(|| ProviderError::RateLimited), 4000);
        let err = analyzer.handle("u", chart(None)).await.unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, _)));
        let session = analyzer.sessions().snapshot("u").await.unwrap();
        assert_eq!(session.stage, AnalysisStage::Ready);
    }

    #[tokio::test]
    async fn test_quick_does_not_touch_sequence() {
        let (analyzer, _) = analyzer(MockVisionProvider::canned("XAUUSD D1 range"), 4000);
        let input = AnalysisInput {
            action: Some(AnalysisAction::Quick),
            ..chart(None)
        };
        let outcome = analyzer.handle("u", input).await.unwrap();
        assert_eq!(outcome.stage, AnalysisStage::Ready);
        assert_eq!(outcome.instrument.as_ref().map(|i| i.symbol()), Some("XAU/USD"));
        assert!(analyzer.sessions().is_empty());
        assert!(analyzer.sessions().snapshot("u").await.is_none());
    }

    #[tokio::test]
    async fn test_quick_does_not_wait_for_sequence() {
        let (analyzer, _) = analyzer(MockVisionProvider::canned("XAUUSD D1 range"), 4000);
        let _held = analyzer.sessions().lock("u").await;
        let input = AnalysisInput {
            action: Some(AnalysisAction::Quick),
            ..chart(None)
        };
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            analyzer.handle("u", input),
        )
        .await
        .expect("quick read blocked on the session lock")
        .unwrap();
        assert_eq!(outcome.action, AnalysisAction::Quick);
    }

    #[tokio::test]
    async fn test_caption_timeframe_beats_answer() {
        let (analyzer, _) = analyzer(
            MockVisionProvider::canned("BTCUSDT H4 trend, H4 demand zone"),
            4000,
        );
        let first = analyzer.handle("u", chart(Some("H4"))).await.unwrap();
        assert_eq!(first.timeframe, Some(Timeframe::H4));

        let second = analyzer.handle("u", chart(Some("M15 entry"))).await.unwrap();
        assert_eq!(second.timeframe, Some(Timeframe::M15));
        // No instrument in the caption, so the answer supplies it.
        assert_eq!(second.instrument.as_ref().map(|i| i.symbol()), Some("BTC/USDT"));
        assert!(second.warnings.is_empty(), "{:?}", second.warnings);
    }

    #[tokio::test]
    async fn test_quick_without_image_is_bad_request() {
        let (analyzer, _) = analyzer(MockVisionProvider::new(), 4000);
        let err = analyzer
            .handle(
                "u",
                AnalysisInput {
                    action: Some(AnalysisAction::Quick),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_reset_and_status_skip_model() {
        let (analyzer, provider) = analyzer(MockVisionProvider::canned("GBPJPY H1"), 4000);
        analyzer.handle("u", chart(None)).await.unwrap();

        let status = analyzer
            .handle(
                "u",
                AnalysisInput {
                    action: Some(AnalysisAction::Status),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status.stage, AnalysisStage::FirstDone);
        assert!(status.message.contains("GBP/JPY H1"));

        let reset = analyzer
            .handle(
                "u",
                AnalysisInput {
                    action: Some(AnalysisAction::Reset),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(reset.stage, AnalysisStage::Ready);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_long_answer_truncated() {
        let long = "Trend is up. ".repeat(100);
        let (analyzer, _) = analyzer(MockVisionProvider::canned(long), 200);
        let outcome = analyzer.handle("u", chart(None)).await.unwrap();
        assert!(outcome.truncated);
        assert!(outcome.message.chars().count() <= 200);
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let (analyzer, _) = analyzer(MockVisionProvider::new(), 4000);
        let err = analyzer.handle("u", AnalysisInput::default()).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_consistency_warnings() {
        let first = ChartRecord {
            analysis: String::new(),
            timeframe: Some(Timeframe::H1),
            instrument: detect_instrument("EURUSD"),
            analyzed_at: Utc::now(),
        };
        let other = detect_instrument("GBPUSD");
        let warnings = consistency_warnings(Some(&first), Some(Timeframe::H4), other.as_ref());
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("not a lower timeframe"));

        let same = detect_instrument("EURUSD");
        assert!(consistency_warnings(Some(&first), Some(Timeframe::M5), same.as_ref()).is_empty());
    }
}
