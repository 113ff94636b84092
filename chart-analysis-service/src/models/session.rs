//! Per-user analysis session: the fixed chart → chart → feedback sequence.

use crate::utils::{Instrument, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Progress through the analysis sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    Ready,
    FirstDone,
    BothDone,
    Completed,
}

impl AnalysisStage {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStage::Ready => "ready",
            AnalysisStage::FirstDone => "first_done",
            AnalysisStage::BothDone => "both_done",
            AnalysisStage::Completed => "completed",
        }
    }

    /// What the user should send next.
    pub fn next_step(self) -> &'static str {
        match self {
            AnalysisStage::Ready => "Send a higher-timeframe chart to start the analysis.",
            AnalysisStage::FirstDone => {
                "Now send a lower-timeframe chart of the same instrument."
            }
            AnalysisStage::BothDone => {
                "Reply with your view or questions about the setup to get the final plan."
            }
            AnalysisStage::Completed => {
                "Ask a follow-up question, or send a new chart to start over."
            }
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a request asks the service to do. Each variant selects one prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisAction {
    FirstChart,
    SecondChart,
    Feedback,
    Quick,
    Reset,
    Status,
}

impl AnalysisAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisAction::FirstChart => "first_chart",
            AnalysisAction::SecondChart => "second_chart",
            AnalysisAction::Feedback => "feedback",
            AnalysisAction::Quick => "quick",
            AnalysisAction::Reset => "reset",
            AnalysisAction::Status => "status",
        }
    }

    pub fn requires_image(self) -> bool {
        matches!(
            self,
            AnalysisAction::FirstChart | AnalysisAction::SecondChart | AnalysisAction::Quick
        )
    }

    /// Whether the action calls the model (and so needs a subscription).
    pub fn calls_model(self) -> bool {
        !matches!(self, AnalysisAction::Reset | AnalysisAction::Status)
    }
}

impl FromStr for AnalysisAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first_chart" | "first" | "chart1" => Ok(AnalysisAction::FirstChart),
            "second_chart" | "second" | "chart2" => Ok(AnalysisAction::SecondChart),
            "feedback" => Ok(AnalysisAction::Feedback),
            "quick" | "single" => Ok(AnalysisAction::Quick),
            "reset" => Ok(AnalysisAction::Reset),
            "status" => Ok(AnalysisAction::Status),
            other => Err(format!("Unknown action '{}'", other)),
        }
    }
}

impl<'de> Deserialize<'de> for AnalysisAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for AnalysisAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Send your first chart before the second one.")]
    FirstChartMissing,

    #[error("Both charts must be analysed before feedback.")]
    ChartsMissing,

    #[error("Both charts are analysed; reply with feedback or reset to start over.")]
    AwaitingFeedback,

    #[error("Nothing to analyse: attach a chart image or send a message.")]
    NothingToDo,

    #[error("The '{0}' action needs a chart image.")]
    ImageRequired(AnalysisAction),

    #[error("Feedback needs a message.")]
    TextRequired,
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::NothingToDo
            | TransitionError::ImageRequired(_)
            | TransitionError::TextRequired => AppError::BadRequest(anyhow::anyhow!(err)),
            TransitionError::FirstChartMissing
            | TransitionError::ChartsMissing
            | TransitionError::AwaitingFeedback => AppError::Conflict(anyhow::anyhow!(err)),
        }
    }
}

/// Result of analysing one chart.
#[derive(Debug, Clone, Serialize)]
pub struct ChartRecord {
    pub analysis: String,
    pub timeframe: Option<Timeframe>,
    pub instrument: Option<Instrument>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserSession {
    pub stage: AnalysisStage,
    pub first: Option<ChartRecord>,
    pub second: Option<ChartRecord>,
    pub last_answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSession {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            stage: AnalysisStage::Ready,
            first: None,
            second: None,
            last_answer: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pick the action for a request.
    ///
    /// An explicit action wins. Otherwise an image means "the next chart" and a
    /// bare message means feedback.
    pub fn resolve_action(
        &self,
        requested: Option<AnalysisAction>,
        has_image: bool,
        has_text: bool,
    ) -> Result<AnalysisAction, TransitionError> {
        if let Some(action) = requested {
            return Ok(action);
        }
        if has_image {
            return Ok(match self.stage {
                AnalysisStage::Ready | AnalysisStage::Completed => AnalysisAction::FirstChart,
                AnalysisStage::FirstDone | AnalysisStage::BothDone => AnalysisAction::SecondChart,
            });
        }
        if has_text {
            return Ok(AnalysisAction::Feedback);
        }
        Err(TransitionError::NothingToDo)
    }

    /// Validate `action` against the current stage without changing anything.
    pub fn check(&self, action: AnalysisAction) -> Result<(), TransitionError> {
        use AnalysisStage::*;
        match (action, self.stage) {
            (AnalysisAction::FirstChart, BothDone) => Err(TransitionError::AwaitingFeedback),
            (AnalysisAction::FirstChart, _) => Ok(()),
            (AnalysisAction::SecondChart, FirstDone | BothDone) => Ok(()),
            (AnalysisAction::SecondChart, _) => Err(TransitionError::FirstChartMissing),
            (AnalysisAction::Feedback, BothDone | Completed) => Ok(()),
            (AnalysisAction::Feedback, _) => Err(TransitionError::ChartsMissing),
            (AnalysisAction::Quick | AnalysisAction::Reset | AnalysisAction::Status, _) => Ok(()),
        }
    }

    /// Store the first chart; this starts a fresh cycle.
    pub fn record_first(&mut self, record: ChartRecord) {
        self.updated_at = record.analyzed_at;
        self.first = Some(record);
        self.second = None;
        self.last_answer = None;
        self.stage = AnalysisStage::FirstDone;
    }

    pub fn record_second(&mut self, record: ChartRecord) {
        self.updated_at = record.analyzed_at;
        self.second = Some(record);
        self.last_answer = None;
        self.stage = AnalysisStage::BothDone;
    }

    pub fn record_feedback(&mut self, answer: String, now: DateTime<Utc>) {
        self.last_answer = Some(answer);
        self.updated_at = now;
        self.stage = AnalysisStage::Completed;
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        *self = UserSession::new(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str) -> ChartRecord {
        ChartRecord {
            analysis: text.to_string(),
            timeframe: None,
            instrument: None,
            analyzed_at: Utc::now(),
        }
    }

    #[test]
    fn test_full_sequence() {
        let mut s = UserSession::new(Utc::now());
        assert_eq!(s.stage, AnalysisStage::Ready);

        assert!(s.check(AnalysisAction::FirstChart).is_ok());
        s.record_first(record("one"));
        assert_eq!(s.stage, AnalysisStage::FirstDone);

        assert!(s.check(AnalysisAction::SecondChart).is_ok());
        s.record_second(record("two"));
        assert_eq!(s.stage, AnalysisStage::BothDone);

        assert!(s.check(AnalysisAction::Feedback).is_ok());
        s.record_feedback("plan".into(), Utc::now());
        assert_eq!(s.stage, AnalysisStage::Completed);
        assert_eq!(s.last_answer.as_deref(), Some("plan"));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut s = UserSession::new(Utc::now());
        assert_eq!(
            s.check(AnalysisAction::SecondChart),
            Err(TransitionError::FirstChartMissing)
        );
        assert_eq!(
            s.check(AnalysisAction::Feedback),
            Err(TransitionError::ChartsMissing)
        );

        s.record_first(record("one"));
        assert_eq!(
            s.check(AnalysisAction::Feedback),
            Err(TransitionError::ChartsMissing)
        );

        s.record_second(record("two"));
        assert_eq!(
            s.check(AnalysisAction::FirstChart),
            Err(TransitionError::AwaitingFeedback)
        );
    }

    #[test]
    fn test_first_chart_after_completion_restarts() {
        let mut s = UserSession::new(Utc::now());
        s.record_first(record("one"));
        s.record_second(record("two"));
        s.record_feedback("plan".into(), Utc::now());

        assert!(s.check(AnalysisAction::FirstChart).is_ok());
        s.record_first(record("again"));
        assert_eq!(s.stage, AnalysisStage::FirstDone);
        assert!(s.second.is_none());
        assert!(s.last_answer.is_none());
    }

    #[test]
    fn test_resolve_action_by_stage() {
        let mut s = UserSession::new(Utc::now());
        assert_eq!(
            s.resolve_action(None, true, false),
            Ok(AnalysisAction::FirstChart)
        );
        s.record_first(record("one"));
        assert_eq!(
            s.resolve_action(None, true, true),
            Ok(AnalysisAction::SecondChart)
        );
        assert_eq!(
            s.resolve_action(None, false, true),
            Ok(AnalysisAction::Feedback)
        );
        assert_eq!(
            s.resolve_action(None, false, false),
            Err(TransitionError::NothingToDo)
        );
        assert_eq!(
            s.resolve_action(Some(AnalysisAction::Quick), false, false),
            Ok(AnalysisAction::Quick)
        );
    }

    #[test]
    fn test_reset_returns_to_ready() {
        let mut s = UserSession::new(Utc::now());
        s.record_first(record("one"));
        s.reset(Utc::now());
        assert_eq!(s.stage, AnalysisStage::Ready);
        assert!(s.first.is_none());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("chart1".parse::<AnalysisAction>(), Ok(AnalysisAction::FirstChart));
        assert_eq!(" Second ".parse::<AnalysisAction>(), Ok(AnalysisAction::SecondChart));
        assert_eq!("single".parse::<AnalysisAction>(), Ok(AnalysisAction::Quick));
        assert!("dance".parse::<AnalysisAction>().is_err());

        let parsed: AnalysisAction = serde_json::from_str("\"feedback\"").unwrap();
        assert_eq!(parsed, AnalysisAction::Feedback);
    }
}
