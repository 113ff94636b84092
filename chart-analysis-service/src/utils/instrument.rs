//! Best-effort detection of the traded instrument (currency pair, metal,
//! crypto or index) from free text.

use super::timeframe::most_frequent;
use serde::Serialize;
use std::fmt;

const CURRENCY_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CHF", "AUD", "NZD", "CAD", "SEK", "NOK", "DKK", "SGD", "HKD",
    "CNH", "MXN", "ZAR", "TRY", "PLN", "XAU", "XAG", "BTC", "ETH", "SOL", "XRP", "USDT",
];

const ALIASES: &[(&str, &str)] = &[
    ("GOLD", "XAU/USD"),
    ("SILVER", "XAG/USD"),
    ("BITCOIN", "BTC/USD"),
    ("ETHEREUM", "ETH/USD"),
    ("US30", "US30"),
    ("DJ30", "US30"),
    ("NAS100", "NAS100"),
    ("NASDAQ", "NAS100"),
    ("USTEC", "NAS100"),
    ("SPX500", "SPX500"),
    ("SP500", "SPX500"),
    ("US500", "SPX500"),
    ("USOIL", "USOIL"),
    ("WTI", "USOIL"),
    ("GER40", "GER40"),
    ("DAX", "GER40"),
];

/// Normalized instrument symbol, e.g. `EUR/USD` or `NAS100`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn symbol(&self) -> &str {
        &self.0
    }

    fn pair(base: &str, quote: &str) -> Self {
        Instrument(format!("{}/{}", base, quote))
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_code(s: &str) -> bool {
    CURRENCY_CODES.contains(&s)
}

/// `EURUSD`, `BTCUSDT`: split where both halves are known codes.
fn split_concatenated(token: &str) -> Option<Instrument> {
    if !(6..=8).contains(&token.len()) || !token.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    (3..=token.len() - 3).find_map(|at| {
        let (base, quote) = token.split_at(at);
        (is_code(base) && is_code(quote) && base != quote).then(|| Instrument::pair(base, quote))
    })
}

fn parse_plain(token: &str) -> Option<Instrument> {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == token)
        .map(|(_, symbol)| Instrument(symbol.to_string()))
        .or_else(|| split_concatenated(token))
}

/// Return every instrument mention in `text`, in order of appearance.
pub fn instrument_mentions(text: &str) -> Vec<Instrument> {
    let upper = text.to_ascii_uppercase();
    let mut found = Vec::new();

    for token in upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '/' || c == '-'))
        .filter(|t| !t.is_empty())
    {
        let parts: Vec<&str> = token
            .split(|c: char| c == '/' || c == '-')
            .filter(|p| !p.is_empty())
            .collect();

        if let [base, quote] = parts.as_slice() {
            if is_code(base) && is_code(quote) && base != quote {
                found.push(Instrument::pair(base, quote));
                continue;
            }
        }

        found.extend(parts.into_iter().filter_map(parse_plain));
    }

    found
}

/// Pick the instrument mentioned most often; ties go to the earliest mention.
pub fn detect_instrument(text: &str) -> Option<Instrument> {
    most_frequent(instrument_mentions(text))
}
