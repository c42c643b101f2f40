//! Input sanitization applied before persistence and prompt use.

use std::sync::LazyLock;

use regex::Regex;

const FILTERED: &str = "[filtered]";

static ANSI_ESCAPES: LazyLock<Option<Regex>> = LazyLock::new(|| {
    // CSI sequences and OSC sequences terminated by BEL or ST.
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").ok()
});

static INJECTIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:ignore|disregard|forget)\s+(?:all\s+|any\s+)?(?:the\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|prompts|context|messages)",
        r"(?im)^\s*(?:system|assistant)\s*:",
        r"(?i)<\s*/?\s*(?:script|iframe|object|embed|style)\b[^>]*>",
        r"(?i)\bjavascript\s*:",
        r"(?i)<\|(?:im_start|im_end|endoftext|system)\|>",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Best-effort cleanup: strips ANSI escapes, control characters (keeping
/// newline, tab and carriage return), bidi overrides and zero-width
/// characters, then neutralizes known injection patterns. Never fails.
pub fn sanitize(text: &str) -> String {
    let without_escapes = match ANSI_ESCAPES.as_ref() {
        Some(re) => re.replace_all(text, ""),
        None => text.into(),
    };

    let mut cleaned: String = without_escapes
        .chars()
        .filter(|c| !is_stripped(*c))
        .collect();

    for pattern in INJECTIONS.iter() {
        if pattern.is_match(&cleaned) {
            cleaned = pattern.replace_all(&cleaned, FILTERED).into_owned();
        }
    }
    cleaned
}

fn is_stripped(c: char) -> bool {
    if matches!(c, '\n' | '\t' | '\r') {
        return false;
    }
    c.is_control()
        || matches!(c,
            '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FEFF}')
}
