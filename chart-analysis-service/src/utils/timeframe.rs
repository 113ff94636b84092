//! Best-effort chart timeframe detection from free text.
//!
//! Both the user's caption and the model's answer are scanned. Traders write
//! timeframes in many ways (`H4`, `4h`, `4 hour`, `240m`, `daily`), so this is
//! plain token matching, not a grammar.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Timeframe {
    pub fn label(self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::MN1 => "MN1",
        }
    }

    fn from_parts(value: u32, unit: Unit) -> Option<Self> {
        let minutes = match unit {
            Unit::Minute => value,
            Unit::Hour => value.checked_mul(60)?,
            Unit::Day => value.checked_mul(1_440)?,
            Unit::Week => value.checked_mul(10_080)?,
            Unit::Month => return (value == 1).then_some(Timeframe::MN1),
        };
        match minutes {
            1 => Some(Timeframe::M1),
            5 => Some(Timeframe::M5),
            15 => Some(Timeframe::M15),
            30 => Some(Timeframe::M30),
            60 => Some(Timeframe::H1),
            240 => Some(Timeframe::H4),
            1_440 => Some(Timeframe::D1),
            10_080 => Some(Timeframe::W1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn parse_unit(word: &str) -> Option<Unit> {
    match word {
        "m" | "min" | "mins" | "minute" | "minutes" => Some(Unit::Minute),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(Unit::Hour),
        "d" | "day" | "days" => Some(Unit::Day),
        "w" | "wk" | "week" | "weeks" => Some(Unit::Week),
        "mo" | "mn" | "month" | "months" => Some(Unit::Month),
        _ => None,
    }
}

/// Parse a single token such as `H4`, `m15`, `15min`, `1M` or `daily`.
fn parse_token(raw: &str) -> Option<Timeframe> {
    // TradingView writes monthly as `1M` and one minute as `1m`.
    if raw == "1M" {
        return Some(Timeframe::MN1);
    }

    let token = raw.to_ascii_lowercase();
    match token.as_str() {
        "daily" | "d1" => return Some(Timeframe::D1),
        "weekly" | "w1" => return Some(Timeframe::W1),
        "monthly" | "mn" | "mn1" => return Some(Timeframe::MN1),
        "hourly" => return Some(Timeframe::H1),
        _ => {}
    }

    let split = token.find(|c: char| c.is_ascii_digit())?;
    if split > 0 {
        // Prefix form: m15, h4
        let (unit, digits) = token.split_at(split);
        let value: u32 = digits.parse().ok()?;
        let unit = match unit {
            "m" => Unit::Minute,
            "h" => Unit::Hour,
            "d" => Unit::Day,
            "w" => Unit::Week,
            _ => return None,
        };
        return Timeframe::from_parts(value, unit);
    }

    // Suffix form: 15m, 4hr, 1d
    let end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    let (digits, unit) = token.split_at(end);
    if unit.is_empty() {
        return None;
    }
    Timeframe::from_parts(digits.parse().ok()?, parse_unit(unit)?)
}

/// Return every timeframe mention in `text`, in order of appearance.
pub fn timeframe_mentions(text: &str) -> Vec<Timeframe> {
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let mut found = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if let Some(tf) = parse_token(token) {
            found.push(tf);
        } else if token.chars().all(|c| c.is_ascii_digit()) {
            // Two-token form: "4 hour", "15 minutes"
            if let Some(next) = tokens.get(i + 1) {
                let next = next.to_ascii_lowercase();
                // A bare "m"/"h" after a number is too ambiguous in prose.
                if next.len() > 1 {
                    if let (Ok(value), Some(unit)) = (token.parse::<u32>(), parse_unit(&next)) {
                        if let Some(tf) = Timeframe::from_parts(value, unit) {
                            found.push(tf);
                            i += 1;
                        }
                    }
                }
            }
        }
        i += 1;
    }
    found
}

/// Pick the timeframe mentioned most often; ties go to the earliest mention.
pub fn detect_timeframe(text: &str) -> Option<Timeframe> {
    most_frequent(timeframe_mentions(text))
}

pub(crate) fn most_frequent<T: Clone + Eq + std::hash::Hash>(items: Vec<T>) -> Option<T> {
    let mut counts: HashMap<T, (usize, usize)> = HashMap::new();
    for (pos, item) in items.into_iter().enumerate() {
        counts.entry(item).or_insert((0, pos)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (ca, pa)), (_, (cb, pb))| ca.cmp(cb).then(pb.cmp(pa)))
        .map(|(item, _)| item)
}
