//! Shaping model output into something a chat message can carry.

/// Appended when an answer had to be shortened.
pub const TRUNCATION_MARKER: &str = "\n\n… (analysis shortened)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub text: String,
    pub truncated: bool,
}

/// Normalize line endings, strip trailing spaces and collapse runs of blank lines.
pub fn tidy_response(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.replace("\r\n", "\n").lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

/// Shorten `text` to at most `max_chars` characters (not bytes).
///
/// The cut prefers, in order, the last paragraph break, the last sentence end
/// and the last whitespace within the budget, as long as that keeps at least
/// half of it; otherwise it cuts mid-word.
pub fn truncate_for_message(text: &str, max_chars: usize) -> Truncated {
    if text.chars().count() <= max_chars {
        return Truncated {
            text: text.to_string(),
            truncated: false,
        };
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return Truncated {
            text: text.chars().take(max_chars).collect(),
            truncated: true,
        };
    }

    let budget = max_chars - marker_len;
    let byte_limit = text
        .char_indices()
        .nth(budget)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..byte_limit];
    let cut = find_break(head, head.len() / 2);

    let mut out = head[..cut].trim_end().to_string();
    out.push_str(TRUNCATION_MARKER);

    Truncated {
        text: out,
        truncated: true,
    }
}

fn find_break(head: &str, min_keep: usize) -> usize {
    let paragraph = head.rfind("\n\n");
    let sentence = [". ", "! ", "? ", ".\n"]
        .iter()
        .filter_map(|p| head.rfind(p).map(|i| i + 1))
        .max();
    let space = head.rfind(char::is_whitespace);

    [paragraph, sentence, space]
        .into_iter()
        .flatten()
        .find(|&i| i >= min_keep)
        .unwrap_or(head.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tidy_collapses_blank_lines() {
        let raw = "  Trend: up  \r\n\r\n\r\n\nLevels:\n- 1.0850   \n\n";
        assert_eq!(tidy_response(raw), "Trend: up\n\nLevels:\n- 1.0850");
    }

    #[test]
    fn test_short_text_untouched() {
        let t = truncate_for_message("short", 100);
        assert_eq!(t.text, "short");
        assert!(!t.truncated);
    }

    #[test]
    fn test_cuts_at_paragraph() {
        let first = "a".repeat(60);
        let text = format!("{}\n\n{}", first, "b".repeat(200));
        let t = truncate_for_message(&text, 100);
        assert!(t.truncated);
        assert_eq!(t.text, format!("{}{}", first, TRUNCATION_MARKER));
    }

    #[test]
    fn test_cuts_at_sentence() {
        let text = format!("{}. {}", "word ".repeat(12).trim_end(), "x".repeat(200));
        let t = truncate_for_message(&text, 90);
        assert!(t.text.starts_with("word word"));
        assert!(t.text.ends_with(&format!("word.{}", TRUNCATION_MARKER)));
    }

    #[test]
    fn test_respects_char_budget_with_multibyte() {
        let text = "📈 ".repeat(500);
        let t = truncate_for_message(&text, 120);
        assert!(t.truncated);
        assert!(t.text.chars().count() <= 120);
    }

    #[test]
    fn test_tiny_budget() {
        let t = truncate_for_message("abcdefghijklmnopqrstuvwxyz0123456789", 5);
        assert_eq!(t.text, "abcde");
        assert!(t.truncated);
    }
}
