//! Structured patch-rule definitions.
//!
//! Rules written as data (JSON) instead of code, for the CLI, the FFI and
//! developer tooling. Only templates are supported as replacements; callback
//! replacements need a plugin written in Rust.
//!
//! ```json
//! [
//!   {
//!     "plugin": "NoTrack",
//!     "patches": [
//!       {
//!         "find": "return null",
//!         "replacement": { "match": { "regex": "return null" }, "replace": "return 42" }
//!       }
//!     ]
//!   }
//! ]
//! ```

use crate::error::PatchError;
use crate::patches::{Find, Match, PatchRule, Replacement};
use serde::{Deserialize, Serialize};

/// A literal string or `{ "regex": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternDef {
    Text(String),
    Regex { regex: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplacementDef {
    #[serde(rename = "match")]
    pub matcher: PatternDef,
    pub replace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchRuleDef {
    pub find: PatternDef,
    pub replacement: OneOrMany<ReplacementDef>,
    #[serde(default)]
    pub all: bool,
    #[serde(default, alias = "noWarn")]
    pub no_warn: bool,
    #[serde(default)]
    pub group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRulesDef {
    pub plugin: String,
    pub patches: Vec<PatchRuleDef>,
}

impl PatchRuleDef {
    pub fn compile(self) -> Result<PatchRule, PatchError> {
        let find = match self.find {
            PatternDef::Text(text) => Find::text(text),
            PatternDef::Regex { regex } => Find::pattern(&regex)?,
        };

        let mut rule = PatchRule::new(find);
        for def in self.replacement.into_vec() {
            let matcher = match def.matcher {
                PatternDef::Text(text) => Match::text(text),
                PatternDef::Regex { regex } => Match::regex(&regex)?,
            };
            rule = rule.with_replacement(Replacement::new(matcher, def.replace));
        }

        rule.all = self.all;
        rule.no_warn = self.no_warn;
        rule.group = self.group;
        Ok(rule)
    }
}

/// Parses plugin rule definitions, in file order.
pub fn parse_rules_json(json: &str) -> Result<Vec<(String, PatchRule)>, PatchError> {
    let defs: Vec<PluginRulesDef> = serde_json::from_str(json)?;
    let mut rules = Vec::new();
    for plugin in defs {
        for def in plugin.patches {
            rules.push((plugin.plugin.clone(), def.compile()?));
        }
    }
    Ok(rules)
}
