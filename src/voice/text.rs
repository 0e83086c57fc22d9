//! Reply text preparation for speech
//!
//! Basic punctuation heuristics only: markdown markers are not read aloud,
//! whitespace is collapsed, and the text ends on a sentence boundary.

/// Prepare assistant text for synthesis
#[must_use]
pub fn prepare_for_speech(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let line = strip_line_markers(line.trim());
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            if !ends_sentence(&out) {
                out.push('.');
            }
            out.push(' ');
        }
        out.push_str(&line);
    }

    let mut collapsed = collapse_whitespace(&strip_links(&out));
    collapsed.retain(|c| !matches!(c, '*' | '_' | '`' | '#'));
    let mut result = collapse_whitespace(&collapsed);

    if !result.is_empty() && !ends_sentence(&result) {
        result.push('.');
    }
    result
}

/// Remove heading, quote, and list markers from the start of a line
fn strip_line_markers(line: &str) -> String {
    let line = line.trim_start_matches(['#', '>']).trim_start();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("+ "))
        .unwrap_or(line);

    // Numbered list items: "1. ", "12) "
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.to_string();
        }
    }
    line.to_string()
}

/// Replace `[label](url)` with `label`
fn strip_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find("](").map(|i| open + i) else {
            break;
        };
        let Some(end) = rest[close..].find(')').map(|i| close + i) else {
            break;
        };
        out.push_str(&rest[..open]);
        out.push_str(&rest[open + 1..close]);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ends_sentence(text: &str) -> bool {
    text.trim_end()
        .ends_with(['.', '!', '?', ':', ';', '…'])
}
