//! Patch helper: try a single match/replace against one module source.

use crate::config::DEFAULT_PLUGIN_ROOT;
use crate::error::PatchError;
use crate::patches::{compile_pattern, plugin_path, Match, Replacement};
use serde::Serialize;

/// Characters of context shown on each side of the match.
pub const CONTEXT_CHARS: usize = 200;

/// Name `$self` resolves to in previews.
pub const HELPER_PLUGIN: &str = "PatchHelper";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchPreview {
    pub matched: bool,
    pub full_match: Option<String>,
    pub groups: Vec<Option<String>>,
    /// Text the match was replaced with
    pub replacement: Option<String>,
    pub context_before: String,
    pub context_after: String,
    pub patched: String,
}

/// Applies `replace` to the first match of `pattern` in `source`.
pub fn preview(source: &str, pattern: &str, replace: &str) -> Result<PatchPreview, PatchError> {
    let regex = compile_pattern(pattern)?;
    let Some(caps) = regex.captures(source) else {
        return Ok(PatchPreview {
            matched: false,
            full_match: None,
            groups: Vec::new(),
            replacement: None,
            context_before: String::new(),
            context_after: String::new(),
            patched: source.to_string(),
        });
    };

    let (start, end, full) = match caps.get(0) {
        Some(m) => (m.start(), m.end(), m.as_str().to_string()),
        None => (0, 0, String::new()),
    };
    let groups = (1..caps.len())
        .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
        .collect();

    let self_path = plugin_path(DEFAULT_PLUGIN_ROOT, HELPER_PLUGIN);
    let patched = Replacement::new(Match::Pattern(regex), replace)
        .apply(source, false, &self_path)
        .map_err(|e| PatchError::ReplaceFailed {
            plugin: HELPER_PLUGIN.to_string(),
            message: format!("{:#}", e),
        })?;

    // The patched text keeps the prefix and suffix of the match untouched.
    let suffix_len = source.len() - end;
    let replacement = patched[start..patched.len() - suffix_len].to_string();

    Ok(PatchPreview {
        matched: true,
        full_match: Some(full),
        groups,
        replacement: Some(replacement),
        context_before: tail_chars(&source[..start], CONTEXT_CHARS).to_string(),
        context_after: head_chars(&source[end..], CONTEXT_CHARS).to_string(),
        patched,
    })
}

fn head_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}
