//! Patch rule model and canonicalization.
//!
//! A [`PatchRule`] is the declarative find/replace instruction a plugin contributes.
//! Patterns are written against minified module source whose identifiers change
//! between builds, so every pattern goes through [`canonicalize_pattern`], which
//! expands the `\i` escape into a generic identifier class.
//!
//! Replacement templates follow the JavaScript `String.prototype.replace`
//! conventions (`$1`, `$&`, `$$`, `` $` ``, `$'`, `$<name>`) plus `$self`, which
//! resolves to the owning plugin's path.

use crate::error::PatchError;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Character class substituted for every `\i` token.
pub const IDENTIFIER_CLASS: &str = r"(?:[A-Za-z_$][\w$]*)";

/// Token in replacement text that resolves to the owning plugin.
pub const SELF_TOKEN: &str = "$self";

/// Dynamic gate evaluated when a rule or replacement is about to run.
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Callback form of a replacement. Receives the match and its groups.
pub type ReplaceFn = Arc<dyn Fn(&ReplaceArgs<'_>) -> anyhow::Result<String> + Send + Sync>;

/// Expands `\i` into [`IDENTIFIER_CLASS`]. Other escapes are left untouched,
/// so an escaped backslash followed by `i` (`\\i`) stays literal.
pub fn canonicalize_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('i') => out.push_str(IDENTIFIER_CLASS),
            Some(next) => {
                out.push('\\');
                out.push(next);
            }
            None => out.push('\\'),
        }
    }

    out
}

/// Canonicalizes and compiles a pattern.
pub fn compile_pattern(pattern: &str) -> Result<Regex, PatchError> {
    let canonical = canonicalize_pattern(pattern);
    Regex::new(&canonical).map_err(|source| PatchError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// The `$self` expansion for a plugin: `<root>["<name>"]`.
pub fn plugin_path(root: &str, plugin: &str) -> String {
    let quoted = serde_json::to_string(plugin).unwrap_or_else(|_| format!("\"{}\"", plugin));
    format!("{}[{}]", root, quoted)
}

// ============================================================================
// Find / Match
// ============================================================================

/// Gate deciding whether a rule is considered for a module at all.
#[derive(Clone)]
pub enum Find {
    /// Substring that must appear in the module source
    Text(String),
    /// Pattern that must match somewhere in the module source
    Pattern(Regex),
}

impl Find {
    pub fn text(text: impl Into<String>) -> Self {
        Find::Text(text.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self, PatchError> {
        Ok(Find::Pattern(compile_pattern(pattern)?))
    }

    pub fn is_found_in(&self, source: &str) -> bool {
        match self {
            Find::Text(text) => source.contains(text.as_str()),
            Find::Pattern(regex) => regex.is_match(source),
        }
    }
}

impl From<&str> for Find {
    fn from(text: &str) -> Self {
        Find::Text(text.to_string())
    }
}

impl fmt::Display for Find {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Find::Text(text) => write!(f, "{:?}", text),
            Find::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

impl fmt::Debug for Find {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Find({})", self)
    }
}

/// What a replacement rewrites inside the module source.
#[derive(Clone)]
pub enum Match {
    /// Literal text
    Text(String),
    /// Canonicalized regular expression
    Pattern(Regex),
}

impl Match {
    pub fn text(text: impl Into<String>) -> Self {
        Match::Text(text.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, PatchError> {
        Ok(Match::Pattern(compile_pattern(pattern)?))
    }

    fn find_in<'a>(&self, source: &'a str, all: bool) -> Vec<Found<'a>> {
        let limit = if all { usize::MAX } else { 1 };

        match self {
            Match::Text(text) => source
                .match_indices(text.as_str())
                .take(limit)
                .map(|(start, matched)| Found {
                    start,
                    end: start + matched.len(),
                    groups: Vec::new(),
                    named: Vec::new(),
                })
                .collect(),
            Match::Pattern(regex) => regex
                .captures_iter(source)
                .take(limit)
                .filter_map(|caps| {
                    let whole = caps.get(0)?;
                    let groups = (1..caps.len())
                        .map(|i| caps.get(i).map(|m| m.as_str()))
                        .collect();
                    let named = regex
                        .capture_names()
                        .flatten()
                        .map(|name| (name.to_string(), caps.name(name).map(|m| m.as_str())))
                        .collect();
                    Some(Found {
                        start: whole.start(),
                        end: whole.end(),
                        groups,
                        named,
                    })
                })
                .collect(),
        }
    }

    /// Whether this match would hit anything in `source`.
    pub fn is_match(&self, source: &str) -> bool {
        match self {
            Match::Text(text) => source.contains(text.as_str()),
            Match::Pattern(regex) => regex.is_match(source),
        }
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::Text(text) => write!(f, "{:?}", text),
            Match::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

impl fmt::Debug for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Match({})", self)
    }
}

/// One located match with its capture groups.
struct Found<'a> {
    start: usize,
    end: usize,
    groups: Vec<Option<&'a str>>,
    named: Vec<(String, Option<&'a str>)>,
}

/// Arguments handed to a replace callback.
#[derive(Debug)]
pub struct ReplaceArgs<'a> {
    /// Full text of the match
    pub matched: &'a str,
    /// Capture groups, `groups[0]` is group 1
    pub groups: Vec<Option<&'a str>>,
    /// Byte offset of the match in the source
    pub offset: usize,
    /// The whole source being rewritten
    pub source: &'a str,
}

impl<'a> ReplaceArgs<'a> {
    /// Capture group by its 1-based index, as in `$1`.
    pub fn group(&self, index: usize) -> Option<&'a str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i).copied().flatten())
    }
}

// ============================================================================
// Replace
// ============================================================================

/// Replacement text: a template or a callback.
#[derive(Clone)]
pub enum Replace {
    Template(String),
    Callback(ReplaceFn),
}

impl Replace {
    pub fn with<F>(f: F) -> Self
    where
        F: Fn(&ReplaceArgs<'_>) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Replace::Callback(Arc::new(f))
    }
}

impl From<&str> for Replace {
    fn from(template: &str) -> Self {
        Replace::Template(template.to_string())
    }
}

impl From<String> for Replace {
    fn from(template: String) -> Self {
        Replace::Template(template)
    }
}

impl fmt::Debug for Replace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replace::Template(template) => write!(f, "Template({:?})", template),
            Replace::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

/// Expands a JavaScript-style replacement template for one match.
fn expand_template(template: &str, found: &Found<'_>, source: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let group_count = found.groups.len();

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let bytes = after.as_bytes();

        let consumed = match bytes.first() {
            Some(b'$') => {
                out.push('$');
                1
            }
            Some(b'&') => {
                out.push_str(&source[found.start..found.end]);
                1
            }
            Some(b'`') => {
                out.push_str(&source[..found.start]);
                1
            }
            Some(b'\'') => {
                out.push_str(&source[found.end..]);
                1
            }
            Some(b'<') if !found.named.is_empty() => match after.find('>') {
                Some(close) => {
                    let name = &after[1..close];
                    if let Some((_, Some(value))) = found.named.iter().find(|(n, _)| n == name) {
                        out.push_str(value);
                    }
                    close + 1
                }
                None => {
                    out.push('$');
                    0
                }
            },
            Some(first) if first.is_ascii_digit() => {
                let one = (first - b'0') as usize;
                let two = bytes
                    .get(1)
                    .filter(|b| b.is_ascii_digit())
                    .map(|second| one * 10 + (second - b'0') as usize);

                match two {
                    Some(n) if n >= 1 && n <= group_count => {
                        out.push_str(found.groups[n - 1].unwrap_or(""));
                        2
                    }
                    _ if one >= 1 && one <= group_count => {
                        out.push_str(found.groups[one - 1].unwrap_or(""));
                        1
                    }
                    _ => {
                        out.push('$');
                        0
                    }
                }
            }
            _ => {
                out.push('$');
                0
            }
        };

        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}

// ============================================================================
// Replacement / PatchRule
// ============================================================================

/// A single `{match, replace}` pair of a rule.
#[derive(Clone)]
pub struct Replacement {
    pub matcher: Match,
    pub replace: Replace,
    /// Skips this replacement silently when it returns false
    pub predicate: Option<Predicate>,
}

impl Replacement {
    pub fn new(matcher: Match, replace: impl Into<Replace>) -> Self {
        Self {
            matcher,
            replace: replace.into(),
            predicate: None,
        }
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn is_active(&self) -> bool {
        self.predicate.as_ref().map_or(true, |p| p())
    }

    /// Rewrites `source`. Returns the input unchanged when nothing matches.
    pub fn apply(&self, source: &str, all: bool, self_path: &str) -> anyhow::Result<String> {
        let found = self.matcher.find_in(source, all);
        if found.is_empty() {
            return Ok(source.to_string());
        }

        let mut out = String::with_capacity(source.len());
        let mut last = 0;

        for hit in &found {
            out.push_str(&source[last..hit.start]);
            let piece = match &self.replace {
                Replace::Template(template) => {
                    expand_template(&template.replace(SELF_TOKEN, self_path), hit, source)
                }
                Replace::Callback(callback) => {
                    let args = ReplaceArgs {
                        matched: &source[hit.start..hit.end],
                        groups: hit.groups.clone(),
                        offset: hit.start,
                        source,
                    };
                    callback(&args)?.replace(SELF_TOKEN, self_path)
                }
            };
            out.push_str(&piece);
            last = hit.end;
        }

        out.push_str(&source[last..]);
        Ok(out)
    }
}

impl fmt::Debug for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replacement")
            .field("matcher", &self.matcher)
            .field("replace", &self.replace)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Declarative rewrite instruction contributed by a plugin.
#[derive(Clone)]
pub struct PatchRule {
    pub find: Find,
    pub replacements: Vec<Replacement>,
    /// Replace every match instead of the first one
    pub all: bool,
    /// Do not warn when a replacement has no effect
    pub no_warn: bool,
    /// Undo the whole rule if any replacement fails or has no effect
    pub group: bool,
    /// Skips the rule (without counting a failed match) when false
    pub predicate: Option<Predicate>,
}

impl PatchRule {
    pub fn new(find: impl Into<Find>) -> Self {
        Self {
            find: find.into(),
            replacements: Vec::new(),
            all: false,
            no_warn: false,
            group: false,
            predicate: None,
        }
    }

    /// Adds a `{match, replace}` pair.
    pub fn replace(mut self, matcher: Match, replace: impl Into<Replace>) -> Self {
        self.replacements.push(Replacement::new(matcher, replace));
        self
    }

    pub fn with_replacement(mut self, replacement: Replacement) -> Self {
        self.replacements.push(replacement);
        self
    }

    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    pub fn no_warn(mut self) -> Self {
        self.no_warn = true;
        self
    }

    pub fn group(mut self) -> Self {
        self.group = true;
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn is_active(&self) -> bool {
        self.predicate.as_ref().map_or(true, |p| p())
    }
}

impl fmt::Debug for PatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchRule")
            .field("find", &self.find)
            .field("replacements", &self.replacements)
            .field("all", &self.all)
            .field("no_warn", &self.no_warn)
            .field("group", &self.group)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex(pattern: &str) -> Match {
        Match::regex(pattern).unwrap()
    }

    #[test]
    fn test_identifier_escape_expands() {
        assert_eq!(
            canonicalize_pattern(r"\i\.foo"),
            format!(r"{}\.foo", IDENTIFIER_CLASS)
        );
    }

    #[test]
    fn test_escaped_backslash_is_not_identifier() {
        assert_eq!(canonicalize_pattern(r"a\\i"), r"a\\i");
    }

    #[test]
    fn test_identifier_matches_minified_names() {
        let m = regex(r"^(\i)\.render\(");
        assert!(m.is_match("e.render("));
        assert!(m.is_match("$_a1.render("));
        assert!(!m.is_match("1a.render("));
    }

    #[test]
    fn test_invalid_pattern_reports_original() {
        let err = Match::regex(r"(\i").unwrap_err();
        match err {
            PatchError::InvalidPattern { pattern, .. } => assert_eq!(pattern, r"(\i"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_template_groups_and_whole_match() {
        let r = Replacement::new(regex(r"(\i)\((\i)\)"), "[$&|$2|$1|$$]");
        let out = r.apply("x=a(b);", false, "P").unwrap();
        assert_eq!(out, "x=[a(b)|b|a|$];");
    }

    #[test]
    fn test_template_prefix_and_suffix() {
        let r = Replacement::new(Match::text("B"), "<$`|$'>");
        assert_eq!(r.apply("ABC", false, "P").unwrap(), "A<A|C>C");
    }

    #[test]
    fn test_template_named_group() {
        let r = Replacement::new(regex(r"(?P<name>\i)=1"), "$<name>=2");
        assert_eq!(r.apply("foo=1", false, "P").unwrap(), "foo=2");
    }

    #[test]
    fn test_template_out_of_range_group_is_literal() {
        let r = Replacement::new(regex(r"(a)"), "$2$1");
        assert_eq!(r.apply("a", false, "P").unwrap(), "$2a");
    }

    #[test]
    fn test_self_token_resolves() {
        let path = plugin_path("Patchcord.Plugins.plugins", "NoTrack");
        let r = Replacement::new(Match::text("track()"), "$self.track()");
        assert_eq!(
            r.apply("track()", false, &path).unwrap(),
            r#"Patchcord.Plugins.plugins["NoTrack"].track()"#
        );
    }

    #[test]
    fn test_first_vs_all() {
        let r = Replacement::new(Match::text("a"), "b");
        assert_eq!(r.apply("aaa", false, "P").unwrap(), "baa");
        assert_eq!(r.apply("aaa", true, "P").unwrap(), "bbb");
    }

    #[test]
    fn test_callback_receives_groups() {
        let r = Replacement::new(
            regex(r"(\d+)\+(\d+)"),
            Replace::with(|args| {
                let a: u32 = args.group(1).unwrap_or("0").parse()?;
                let b: u32 = args.group(2).unwrap_or("0").parse()?;
                Ok((a + b).to_string())
            }),
        );
        assert_eq!(r.apply("x=2+3;", false, "P").unwrap(), "x=5;");
    }

    #[test]
    fn test_callback_error_propagates() {
        let r = Replacement::new(
            Match::text("x"),
            Replace::with(|_| Err(anyhow::anyhow!("boom"))),
        );
        assert!(r.apply("x", false, "P").is_err());
    }

    #[test]
    fn test_no_match_returns_input() {
        let r = Replacement::new(Match::text("zzz"), "y");
        assert_eq!(r.apply("abc", false, "P").unwrap(), "abc");
    }

    #[test]
    fn test_find_variants() {
        assert!(Find::from("return null").is_found_in("function(){return null}"));
        assert!(Find::pattern(r"\i\.isStaff\(\)").unwrap().is_found_in("if(u.isStaff())"));
        assert!(!Find::text("nope").is_found_in("abc"));
    }
}
