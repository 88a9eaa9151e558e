//! Isolates the newest reply from an email body that may quote earlier messages.

use std::sync::LazyLock;

use regex::Regex;

static BOUNDARY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // "On Mon, Jan 1, 2024 at 10:00 AM Buyer <buyer@acme.test> wrote:"
        r"(?im)^[ \t]*On\s.+?\swrote:[ \t]*$",
        r"(?im)^[ \t]*From:",
        r"(?im)^[ \t]*-{3,}\s*Original Message\s*-{3,}",
        r"(?m)^[ \t]*>",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static QUOTE_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*>+[ \t]?").ok());

static EXCESS_BLANK_LINES: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\n{3,}").ok());

/// Returns the latest reply in `body` with quoted history removed.
///
/// Boundaries only count from the second line on, so a body that opens with
/// a quote marker keeps its first line.
pub fn extract_latest(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n").replace('\r', "\n");

    let cut = BOUNDARY_PATTERNS
        .iter()
        .filter_map(|pattern| {
            pattern
                .find_iter(&normalized)
                .map(|found| found.start())
                .find(|start| *start > 0)
        })
        .min()
        .unwrap_or(normalized.len());

    let latest = normalized[..cut].trim();
    let unquoted = match QUOTE_PREFIX.as_ref() {
        Some(pattern) => pattern.replace_all(latest, "").into_owned(),
        None => latest.to_string(),
    };
    let collapsed = match EXCESS_BLANK_LINES.as_ref() {
        Some(pattern) => pattern.replace_all(&unquoted, "\n\n").into_owned(),
        None => unquoted,
    };
    collapsed.trim().to_string()
}
