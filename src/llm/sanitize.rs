//! Payload extraction for model output
//!
//! Models wrap structured answers in a fenced block and sometimes restate an
//! example block first, so the last fence wins. While a run is still streaming
//! the block is usually unterminated; the text up to the end is used instead.

const FENCE: &str = "```";

/// Isolate the most plausible YAML payload in `raw`.
///
/// Without any fence the trimmed input is returned unchanged; repairs only
/// apply to a fenced payload. An empty block yields `""`.
pub fn sanitize(raw: &str) -> String {
    match last_fenced_block(raw) {
        Some(block) => repair(block.trim()),
        None => raw.trim().to_string(),
    }
}

/// Body of the last opened fence: language tag skipped, closing fence or end of text
fn last_fenced_block(raw: &str) -> Option<&str> {
    let fences: Vec<usize> = raw.match_indices(FENCE).map(|(i, _)| i).collect();
    if fences.is_empty() {
        return None;
    }

    // fences pair up as open/close, so the last opener has an even index
    let opener = (fences.len() - 1) & !1;
    let start = fences[opener] + FENCE.len();
    let end = fences.get(opener + 1).copied().unwrap_or(raw.len());
    let block = &raw[start..end];

    // the rest of the opening line is the language tag
    Some(match block.find('\n') {
        Some(newline) => &block[newline + 1..],
        None => "",
    })
}

/// Fix malformations that appear in truncated or sloppy output
fn repair(payload: &str) -> String {
    let mut text = payload;
    if let Some(rest) = text.strip_prefix(':') {
        if rest.starts_with('\n') || rest.starts_with("\r\n") {
            text = rest.trim_start();
        }
    }

    let mut repaired = text.to_string();
    let last_line = repaired.rsplit('\n').next().unwrap_or_default();
    if unescaped_quotes(last_line) % 2 == 1 {
        repaired.push('"');
    }
    repaired.trim().to_string()
}

fn unescaped_quotes(line: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in line.chars() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => count += 1,
            _ => escaped = false,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fenced_block() {
        assert_eq!(sanitize("```yaml\nkey: value\n```"), "key: value");
        assert_eq!(
            sanitize("Here you go:\n```yaml\nkey: value\n```\nEnjoy!"),
            "key: value"
        );
    }

    #[test]
    fn test_no_fence_returns_trimmed_input() {
        assert_eq!(sanitize("  key: value\n\n"), "key: value");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_empty_fenced_block() {
        assert_eq!(sanitize("```yaml\n```"), "");
        assert_eq!(sanitize("```\n```"), "");
        // opening line still streaming
        assert_eq!(sanitize("```ya"), "");
    }

    #[test]
    fn test_last_block_wins() {
        let raw = "For example:\n```yaml\nkey: example\n```\nAnswer:\n```yaml\nkey: real\n```";
        assert_eq!(sanitize(raw), "key: real");
    }

    #[test]
    fn test_unterminated_block_runs_to_end() {
        let raw = "```yaml\nkey: example\n```\n```yaml\nitems:\n  - a\n";
        assert_eq!(sanitize(raw), "items:\n  - a");
    }

    #[test]
    fn test_repairs_unterminated_quote() {
        assert_eq!(
            sanitize("```yaml\nitems:\n  - name: \"Unterm"),
            "items:\n  - name: \"Unterm\""
        );
        assert_eq!(sanitize("```yaml\nname: \"ok\""), "name: \"ok\"");
        assert_eq!(sanitize("```yaml\nname: \"say \\\"hi"), r#"name: "say \"hi""#);
    }

    #[test]
    fn test_unfenced_text_is_not_repaired() {
        assert_eq!(sanitize("  name: \"a\n"), "name: \"a");
        assert_eq!(sanitize(":\nkey: value"), ":\nkey: value");
    }

    #[test]
    fn test_strips_leading_colon_newline() {
        assert_eq!(sanitize("```yaml\n:\nkey: value\n```"), "key: value");
        assert_eq!(sanitize(":value"), ":value");
    }
}
