//! Prompt templates, one per analysis action.

use crate::models::{AnalysisAction, ChartRecord, UserSession};

/// Earlier analyses are embedded in later prompts; keep them bounded.
const MAX_CONTEXT_CHARS: usize = 2500;
const MAX_CAPTION_CHARS: usize = 1000;

pub const SYSTEM_PROMPT: &str = r#"You are a professional price-action trader and technical analyst reviewing screenshots of trading charts (forex, metals, indices and crypto) sent through a chat bot.

Rules for every answer:
- Write plain text for a chat message. No markdown tables, no code blocks, no HTML.
- Use short sections with a heading line each, and bullet points starting with "- ".
- Always name the instrument and timeframe you read from the chart, e.g. "EUR/USD H4". Write timeframes as M1, M5, M15, M30, H1, H4, D1, W1 or MN1.
- Quote price levels exactly as shown on the chart's price axis.
- If the image is not a price chart, or is unreadable, say so in one sentence and stop.
- Stay under 3500 characters.
- End with a single line: "Not financial advice.""#;

/// Everything needed for one model call except the images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub system: &'static str,
    pub user: String,
    /// Whether the current request's image is sent with the prompt.
    pub with_image: bool,
}

impl PromptSet {
    /// Select and fill the template for `action`. `Reset` and `Status` have no prompt.
    pub fn for_step(
        action: AnalysisAction,
        session: &UserSession,
        caption: Option<&str>,
    ) -> Option<Self> {
        let caption = caption.map(str::trim).filter(|c| !c.is_empty());
        let (user, with_image) = match action {
            AnalysisAction::FirstChart => (first_chart_prompt(caption), true),
            AnalysisAction::SecondChart => {
                (second_chart_prompt(session.first.as_ref(), caption), true)
            }
            AnalysisAction::Feedback => (
                feedback_prompt(
                    session.first.as_ref(),
                    session.second.as_ref(),
                    session.last_answer.as_deref(),
                    caption.unwrap_or_default(),
                ),
                false,
            ),
            AnalysisAction::Quick => (quick_prompt(caption), true),
            AnalysisAction::Reset | AnalysisAction::Status => return None,
        };
        Some(Self {
            system: SYSTEM_PROMPT,
            user,
            with_image,
        })
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{} […]", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

fn caption_block(caption: Option<&str>) -> String {
    match caption {
        Some(c) => format!("\nThe trader's note: \"{}\"\n", clip(c, MAX_CAPTION_CHARS)),
        None => String::new(),
    }
}

fn record_block(label: &str, record: Option<&ChartRecord>) -> String {
    match record {
        Some(r) => {
            let context = match (&r.instrument, &r.timeframe) {
                (Some(i), Some(t)) => format!(" ({} {})", i, t),
                (Some(i), None) => format!(" ({})", i),
                (None, Some(t)) => format!(" ({})", t),
                (None, None) => String::new(),
            };
            format!(
                "--- {}{} ---\n{}\n",
                label,
                context,
                clip(&r.analysis, MAX_CONTEXT_CHARS)
            )
        }
        None => format!("--- {} ---\n(not available)\n", label),
    }
}

pub fn first_chart_prompt(caption: Option<&str>) -> String {
    format!(
        r#"This is the FIRST of two charts: the higher-timeframe context chart.
{}
Analyse it with these sections:
1. Instrument and timeframe
2. Market structure and trend (higher highs/lows, ranges, breaks of structure)
3. Key levels: support, resistance, supply and demand zones, with prices
4. Bias for the lower timeframe: bullish, bearish or neutral, and what would invalidate it

Finish by asking the trader to send the lower-timeframe chart of the same instrument."#,
        caption_block(caption)
    )
}

pub fn second_chart_prompt(first: Option<&ChartRecord>, caption: Option<&str>) -> String {
    format!(
        r#"This is the SECOND chart: the lower-timeframe entry chart. Here is your analysis of the higher-timeframe chart:

{}{}
Analyse the new chart in the context of that bias:
1. Instrument and timeframe (point out if they do not match the first chart)
2. Whether the lower timeframe confirms or contradicts the higher-timeframe bias
3. Entry zone, stop-loss and two take-profit levels, with prices
4. Risk-to-reward and the conditions that would cancel the setup

Finish by asking for the trader's own view before giving a final plan."#,
        record_block("Higher-timeframe analysis", first),
        caption_block(caption)
    )
}

pub fn feedback_prompt(
    first: Option<&ChartRecord>,
    second: Option<&ChartRecord>,
    previous_answer: Option<&str>,
    feedback: &str,
) -> String {
    let previous = previous_answer
        .map(|a| format!("--- Your last reply ---\n{}\n\n", clip(a, MAX_CONTEXT_CHARS)))
        .unwrap_or_default();

    format!(
        r#"You already analysed two charts of this setup:

{}
{}
{}The trader replies: "{}"

Respond to the trader directly. Correct any misunderstanding, then give a final trade plan:
1. Verdict: take the trade, wait for confirmation, or skip
2. Entry, stop-loss and take-profit levels
3. Position management once in profit
4. The single most important thing to watch"#,
        record_block("Higher-timeframe analysis", first),
        record_block("Lower-timeframe analysis", second),
        previous,
        clip(feedback.trim(), MAX_CAPTION_CHARS)
    )
}

pub fn quick_prompt(caption: Option<&str>) -> String {
    format!(
        r#"Give a quick stand-alone analysis of this chart.
{}
Cover:
1. Instrument and timeframe
2. Trend and market structure
3. Key levels with prices
4. One trade idea with entry, stop-loss and take-profit, or say clearly that there is no trade"#,
        caption_block(caption)
    )
}
