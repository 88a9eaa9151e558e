use std::sync::LazyLock;

use kuchiki::traits::*;
use kuchiki::NodeRef;
use regex::Regex;

static BLOCK_BREAKS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6]|blockquote|table)\s*>").ok()
});

/// Plain-text rendering of an HTML email body, one line per block element.
pub(crate) fn html_to_text(html: &str) -> String {
    let with_breaks = match BLOCK_BREAKS.as_ref() {
        Some(pattern) => pattern.replace_all(html, "$0\n").into_owned(),
        None => html.to_string(),
    };
    let document = kuchiki::parse_html().one(with_breaks);
    remove_elements_by_selector(&document, "head, script, style, title, noscript");

    let text = document.text_contents();
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() && lines.last().is_some_and(|last| last.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

fn remove_elements_by_selector(document: &NodeRef, selector: &str) {
    if let Ok(nodes) = document.select(selector) {
        let nodes: Vec<_> = nodes.collect();
        for node in nodes {
            node.as_node().detach();
        }
    }
}
