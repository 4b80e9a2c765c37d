//! Grep-like search over a raw schema document.

use crate::error::{DescriptorError, Result};
use regex::RegexBuilder;
use serde::Deserialize;
use std::fmt::Write as _;

/// Maximum matches returned per search call.
pub const MAX_MATCHES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Lines around each match, used when `before`/`after` are zero.
    pub context: usize,
    pub before: usize,
    pub after: usize,
    /// Matches to skip (pagination).
    pub offset: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            context: 10,
            before: 0,
            after: 0,
            offset: 0,
        }
    }
}

impl SearchOptions {
    fn window(&self) -> (usize, usize) {
        let before = if self.before > 0 {
            self.before
        } else {
            self.context
        };
        let after = if self.after > 0 {
            self.after
        } else {
            self.context
        };
        (before, after)
    }
}

/// Case-insensitive regex search over `raw`.
///
/// Output lines are `N:line` for matches and `N-line` for context, with `--` between
/// non-adjacent groups. A trailer reports further matches reachable through `offset`.
///
/// # Errors
///
/// Returns [`DescriptorError::Search`] if `pattern` is not a valid regex.
pub fn search_schema(raw: &str, pattern: &str, options: &SearchOptions) -> Result<String> {
    let re = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| DescriptorError::Search(e.to_string()))?;

    let lines: Vec<&str> = raw.lines().collect();
    let matches: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| re.is_match(l))
        .map(|(i, _)| i)
        .collect();

    if matches.is_empty() {
        return Ok(format!("No matches for '{pattern}'"));
    }
    if options.offset >= matches.len() {
        return Ok(format!(
            "No matches after offset {} ({} total)",
            options.offset,
            matches.len()
        ));
    }

    let page: Vec<usize> = matches
        .iter()
        .copied()
        .skip(options.offset)
        .take(MAX_MATCHES)
        .collect();
    let (before, after) = options.window();

    let mut out = String::new();
    let mut last_printed: Option<usize> = None;
    for (k, &m) in page.iter().enumerate() {
        let start = m.saturating_sub(before);
        let end = (m + after).min(lines.len().saturating_sub(1));
        let start = match last_printed {
            Some(lp) if lp >= start => lp + 1,
            Some(_) => {
                out.push_str("--\n");
                start
            }
            None => start,
        };
        for (i, line) in lines.iter().enumerate().take(end + 1).skip(start) {
            // A later match inside this window is still printed with ':'.
            let is_match = i == m || page[k + 1..].contains(&i);
            let sep = if is_match { ':' } else { '-' };
            let _ = writeln!(out, "{}{sep}{line}", i + 1);
        }
        last_printed = Some(end.max(last_printed.unwrap_or(0)));
    }

    let shown_to = options.offset + page.len();
    if shown_to < matches.len() {
        let _ = write!(
            out,
            "[{} more matches, use offset={shown_to}]",
            matches.len() - shown_to
        );
    }
    Ok(out.trim_end().to_string())
}
