//! Middle-omission truncation for captured command output.
//!
//! Keeps the start of the output (what ran) and the end (how it finished).

pub const DEFAULT_MAX_CHARS: usize = 30_000;

/// Shorten `text` to about `max_chars` characters by cutting out the middle.
/// Counts characters, not bytes.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let keep_head = max_chars / 2;
    let keep_tail = max_chars - keep_head;
    let head_end = byte_offset(text, keep_head);
    let tail_start = byte_offset(text, total - keep_tail);
    let omitted = total - max_chars;

    format!(
        "{}\n... [{omitted} chars omitted] ...\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

/// Byte index of the `n`-th character (or the end of `text`).
fn byte_offset(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map(|(i, _)| i).unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_unchanged() {
        assert_eq!(truncate_middle("ok\n", 10), "ok\n");
        assert_eq!(truncate_middle("", DEFAULT_MAX_CHARS), "");
        let exact = "x".repeat(64);
        assert_eq!(truncate_middle(&exact, 64), exact);
    }

    #[test]
    fn keeps_both_ends() {
        let text = format!("{}{}{}", "H".repeat(50), "m".repeat(100), "T".repeat(50));
        let out = truncate_middle(&text, 100);
        assert!(out.starts_with(&"H".repeat(50)));
        assert!(out.ends_with(&"T".repeat(50)));
        assert!(out.contains("[100 chars omitted]"));
    }

    #[test]
    fn odd_limit_favours_the_tail() {
        let out = truncate_middle("abcdefghij", 5);
        assert!(out.starts_with("ab\n"));
        assert!(out.ends_with("\nhij"));
    }

    #[test]
    fn multibyte_characters_are_not_split() {
        let text = "ü".repeat(1_000);
        let out = truncate_middle(&text, 101);
        assert!(out.contains("[899 chars omitted]"));
        assert_eq!(out.matches('ü').count(), 101);
    }
}
