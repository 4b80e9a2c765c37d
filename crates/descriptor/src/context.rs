//! Size bounding for rendered schema contexts.

use regex::Regex;
use std::sync::LazyLock;

pub const TRUNCATION_MARKER: &str = "[SCHEMA TRUNCATED - use schema search to explore]";

static DESCRIPTION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r" #[^\n]*").ok());

/// Drop ` # ...` description suffixes.
#[must_use]
pub fn strip_descriptions(context: &str) -> String {
    match DESCRIPTION.as_ref() {
        Some(re) => re.replace_all(context, "").into_owned(),
        None => context.to_string(),
    }
}

/// Fit `context` into `max_chars`: strip descriptions first, then cut and mark truncation.
#[must_use]
pub fn fit_context(context: String, max_chars: usize) -> String {
    if context.chars().count() <= max_chars {
        return context;
    }
    let stripped = strip_descriptions(&context);
    if stripped.chars().count() <= max_chars {
        return stripped;
    }
    let mut cut: String = stripped.chars().take(max_chars).collect();
    cut.push('\n');
    cut.push_str(TRUNCATION_MARKER);
    cut
}
