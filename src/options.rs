//! Plugin option schemas.
//!
//! An [`OptionSchema`] declares the type, default and constraints of one plugin
//! setting. The settings store consults it before committing a write:
//! `is_valid` first, then type coercion.

use crate::error::SettingsError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::sync::Arc;

/// Largest integer an ordinary numeric option can hold (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Message used when `is_valid` returns a bare `false`.
pub const GENERIC_INVALID_MESSAGE: &str = "Invalid input provided.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    String,
    Number,
    BigInt,
    Boolean,
    Select,
    Slider,
    Array,
    Custom,
}

impl OptionType {
    fn expected(&self) -> &'static str {
        match self {
            OptionType::String => "a string",
            OptionType::Number => "a number",
            OptionType::BigInt => "an integer",
            OptionType::Boolean => "a boolean",
            OptionType::Select => "one of the declared choices",
            OptionType::Slider => "a number",
            OptionType::Array => "a list of strings",
            OptionType::Custom => "any value",
        }
    }
}

/// A choice of a select option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: Value,
    #[serde(default)]
    pub default: bool,
}

impl SelectOption {
    pub fn new(label: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            default: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

/// Result of an `is_valid` check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
    /// Invalid, with a message for the user
    Message(String),
}

impl From<bool> for Validity {
    fn from(valid: bool) -> Self {
        if valid {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

impl From<&str> for Validity {
    fn from(message: &str) -> Self {
        Validity::Message(message.to_string())
    }
}

impl From<String> for Validity {
    fn from(message: String) -> Self {
        Validity::Message(message)
    }
}

/// Read-only view of one plugin's settings, handed to validators so they can
/// check a candidate against the other fields.
#[derive(Debug, Clone, Copy)]
pub struct SettingsView<'a> {
    plugin: &'a str,
    values: &'a Map<String, Value>,
}

impl<'a> SettingsView<'a> {
    pub fn new(plugin: &'a str, values: &'a Map<String, Value>) -> Self {
        Self { plugin, values }
    }

    pub fn plugin(&self) -> &'a str {
        self.plugin
    }

    pub fn get(&self, option: &str) -> Option<&'a Value> {
        self.values.get(option)
    }

    pub fn get_bool(&self, option: &str) -> Option<bool> {
        self.get(option).and_then(Value::as_bool)
    }

    pub fn get_str(&self, option: &str) -> Option<&'a str> {
        self.get(option).and_then(Value::as_str)
    }

    pub fn get_f64(&self, option: &str) -> Option<f64> {
        self.get(option).and_then(Value::as_f64)
    }
}

pub type Validator = Arc<dyn Fn(&SettingsView<'_>, &Value) -> Validity + Send + Sync>;

/// Called with the new value and its `plugins.<Name>.<option>` path.
pub type ChangeListener = Arc<dyn Fn(&Value, &str) + Send + Sync>;

pub type SplitFn = Arc<dyn Fn(&str) -> anyhow::Result<Vec<String>> + Send + Sync>;

/// How a legacy delimited string is split into a list.
#[derive(Clone)]
pub enum Separator {
    Text(String),
    Pattern(Regex),
    Custom(SplitFn),
}

impl Separator {
    pub fn split(&self, legacy: &str) -> anyhow::Result<Vec<String>> {
        Ok(match self {
            Separator::Text(sep) => legacy.split(sep.as_str()).map(str::to_string).collect(),
            Separator::Pattern(regex) => regex.split(legacy).map(str::to_string).collect(),
            Separator::Custom(split) => split(legacy)?,
        })
    }
}

impl Default for Separator {
    fn default() -> Self {
        Separator::Text(",".to_string())
    }
}

impl fmt::Debug for Separator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Separator::Text(sep) => write!(f, "Text({:?})", sep),
            Separator::Pattern(regex) => write!(f, "Pattern(/{}/)", regex.as_str()),
            Separator::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Declaration of a single plugin setting.
#[derive(Clone)]
pub struct OptionSchema {
    pub kind: OptionType,
    pub description: String,
    pub default: Option<Value>,
    /// Changes only take effect after a restart
    pub restart_needed: bool,
    /// Left out of settings screens
    pub hidden: bool,
    /// Choices of a select option
    pub choices: Vec<SelectOption>,
    /// Marker positions of a slider
    pub markers: Vec<f64>,
    pub stick_to_markers: bool,
    pub is_valid: Option<Validator>,
    /// Separator for list options stored as delimited strings by older versions
    pub old_string_separator: Option<Separator>,
    pub on_change: Option<ChangeListener>,
}

impl OptionSchema {
    fn of(kind: OptionType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            default: None,
            restart_needed: false,
            hidden: false,
            choices: Vec::new(),
            markers: Vec::new(),
            stick_to_markers: false,
            is_valid: None,
            old_string_separator: None,
            on_change: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::of(OptionType::String, description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::of(OptionType::Number, description)
    }

    pub fn bigint(description: impl Into<String>) -> Self {
        Self::of(OptionType::BigInt, description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::of(OptionType::Boolean, description)
    }

    pub fn select(description: impl Into<String>, choices: Vec<SelectOption>) -> Self {
        Self {
            choices,
            ..Self::of(OptionType::Select, description)
        }
    }

    pub fn slider(description: impl Into<String>, markers: Vec<f64>) -> Self {
        Self {
            markers,
            ..Self::of(OptionType::Slider, description)
        }
    }

    pub fn array(description: impl Into<String>) -> Self {
        Self::of(OptionType::Array, description)
    }

    pub fn custom(description: impl Into<String>) -> Self {
        Self::of(OptionType::Custom, description)
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn restart_needed(mut self) -> Self {
        self.restart_needed = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn stick_to_markers(mut self) -> Self {
        self.stick_to_markers = true;
        self
    }

    pub fn validate_with<F, V>(mut self, validator: F) -> Self
    where
        F: Fn(&SettingsView<'_>, &Value) -> V + Send + Sync + 'static,
        V: Into<Validity>,
    {
        self.is_valid = Some(Arc::new(move |view, value| validator(view, value).into()));
        self
    }

    pub fn separator(mut self, separator: Separator) -> Self {
        self.old_string_separator = Some(separator);
        self
    }

    pub fn on_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(listener));
        self
    }

    /// Value used while nothing is stored. Select options fall back to the
    /// choice flagged as default.
    pub fn default_value(&self) -> Option<Value> {
        if let Some(default) = &self.default {
            return Some(default.clone());
        }
        if self.kind == OptionType::Select {
            return self.choices.iter().find(|c| c.default).map(|c| c.value.clone());
        }
        None
    }

    /// Runs `is_valid`, mapping a rejection to [`SettingsError::Validation`].
    pub fn check(&self, view: &SettingsView<'_>, candidate: &Value) -> Result<(), SettingsError> {
        let Some(validator) = &self.is_valid else {
            return Ok(());
        };
        match validator(view, candidate) {
            Validity::Valid => Ok(()),
            Validity::Invalid => Err(SettingsError::Validation(GENERIC_INVALID_MESSAGE.to_string())),
            Validity::Message(message) => Err(SettingsError::Validation(message)),
        }
    }

    /// Converts a validated candidate to the declared type.
    pub fn coerce(&self, option: &str, value: Value) -> Result<Value, SettingsError> {
        let mismatch = |found: &Value| SettingsError::TypeMismatch {
            option: option.to_string(),
            expected: self.kind.expected(),
            found: describe(found),
        };

        match self.kind {
            OptionType::Custom => Ok(value),
            OptionType::String => match value {
                Value::String(_) => Ok(value),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(mismatch(&other)),
            },
            OptionType::Boolean => match value {
                Value::Bool(_) => Ok(value),
                Value::String(ref s) if s == "true" || s == "false" => Ok(Value::Bool(s == "true")),
                other => Err(mismatch(&other)),
            },
            OptionType::Number => {
                let n = as_finite(&value).ok_or_else(|| mismatch(&value))?;
                let capped = n.clamp(-(MAX_SAFE_INTEGER as f64), MAX_SAFE_INTEGER as f64);
                number_value(capped).ok_or_else(|| mismatch(&value))
            }
            OptionType::BigInt => normalize_integer(&value)
                .map(Value::String)
                .ok_or_else(|| mismatch(&value)),
            OptionType::Slider => {
                let n = as_finite(&value).ok_or_else(|| mismatch(&value))?;
                let n = if self.stick_to_markers {
                    nearest_marker(&self.markers, n).unwrap_or(n)
                } else {
                    n
                };
                number_value(n).ok_or_else(|| mismatch(&value))
            }
            OptionType::Select => {
                if self.choices.iter().any(|c| c.value == value) {
                    Ok(value)
                } else {
                    Err(mismatch(&value))
                }
            }
            OptionType::Array => {
                let all_strings = value.as_array().map_or(false, |items| items.iter().all(Value::is_string));
                if all_strings {
                    Ok(value)
                } else {
                    Err(mismatch(&value))
                }
            }
        }
    }

    /// Splits a legacy delimited string into a list.
    ///
    /// Returns `Ok(None)` when there is nothing to migrate (unset or already a
    /// list), so running it on migrated data is a no-op.
    pub fn migrate_legacy(&self, stored: Option<&Value>) -> anyhow::Result<Option<Vec<String>>> {
        match stored {
            None | Some(Value::Null) | Some(Value::Array(_)) => Ok(None),
            Some(Value::String(legacy)) => {
                let separator = self.old_string_separator.clone().unwrap_or_default();
                Ok(Some(separator.split(legacy)?))
            }
            Some(other) => anyhow::bail!("cannot migrate {} to a list", describe(other)),
        }
    }
}

impl fmt::Debug for OptionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionSchema")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .field("default", &self.default)
            .field("restart_needed", &self.restart_needed)
            .field("hidden", &self.hidden)
            .field("choices", &self.choices)
            .field("markers", &self.markers)
            .field("is_valid", &self.is_valid.is_some())
            .field("old_string_separator", &self.old_string_separator)
            .finish()
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string {:?}", s),
        Value::Array(_) => "a list".to_string(),
        Value::Object(_) => "an object".to_string(),
    }
}

fn as_finite(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Integral values are stored as JSON integers, everything else as floats.
fn number_value(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 {
        Some(Value::Number(Number::from(n as i64)))
    } else {
        Number::from_f64(n).map(Value::Number)
    }
}

/// Arbitrary-precision integers are kept as canonical decimal strings.
fn normalize_integer(value: &Value) -> Option<String> {
    let raw = match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => return Some(n.to_string()),
        Value::Number(n) => {
            let f = n.as_f64()?;
            if f.fract() != 0.0 || !f.is_finite() {
                return None;
            }
            return Some(format!("{:.0}", f));
        }
        Value::String(s) => s.trim(),
        _ => return None,
    };

    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let trimmed = digits.trim_start_matches('0');
    Some(match (trimmed.is_empty(), negative) {
        (true, _) => "0".to_string(),
        (false, true) => format!("-{}", trimmed),
        (false, false) => trimmed.to_string(),
    })
}

fn nearest_marker(markers: &[f64], n: f64) -> Option<f64> {
    markers
        .iter()
        .copied()
        .min_by(|a, b| (a - n).abs().total_cmp(&(b - n).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_capped_at_safe_integer() {
        let schema = OptionSchema::number("Delay");
        assert_eq!(schema.coerce("delay", json!(1e300)).unwrap(), json!(MAX_SAFE_INTEGER));
        assert_eq!(schema.coerce("delay", json!("12")).unwrap(), json!(12));
        assert_eq!(schema.coerce("delay", json!(1.5)).unwrap(), json!(1.5));
        assert!(schema.coerce("delay", json!("abc")).is_err());
    }

    #[test]
    fn test_bigint_keeps_precision() {
        let schema = OptionSchema::bigint("Snowflake");
        let big = "123456789012345678901234567890";
        assert_eq!(schema.coerce("id", json!(big)).unwrap(), json!(big));
        assert_eq!(schema.coerce("id", json!("-0042")).unwrap(), json!("-42"));
        assert_eq!(schema.coerce("id", json!(7)).unwrap(), json!("7"));
        assert!(schema.coerce("id", json!("12a")).is_err());
        assert!(schema.coerce("id", json!(1.5)).is_err());
    }

    #[test]
    fn test_boolean_and_string_coercion() {
        assert_eq!(OptionSchema::boolean("x").coerce("x", json!("true")).unwrap(), json!(true));
        assert!(OptionSchema::boolean("x").coerce("x", json!(1)).is_err());
        assert_eq!(OptionSchema::string("x").coerce("x", json!(5)).unwrap(), json!("5"));
    }

    #[test]
    fn test_select_requires_declared_choice() {
        let schema = OptionSchema::select(
            "Mode",
            vec![
                SelectOption::new("Fast", "fast").as_default(),
                SelectOption::new("Slow", "slow"),
            ],
        );
        assert_eq!(schema.default_value(), Some(json!("fast")));
        assert!(schema.coerce("mode", json!("slow")).is_ok());
        assert!(schema.coerce("mode", json!("medium")).is_err());
    }

    #[test]
    fn test_slider_sticks_to_markers() {
        let schema = OptionSchema::slider("Volume", vec![0.0, 50.0, 100.0]).stick_to_markers();
        assert_eq!(schema.coerce("v", json!(60)).unwrap(), json!(50));
        let free = OptionSchema::slider("Volume", vec![0.0, 100.0]);
        assert_eq!(free.coerce("v", json!(60)).unwrap(), json!(60));
    }

    #[test]
    fn test_validator_messages() {
        let schema = OptionSchema::string("Name").validate_with(|_, v: &Value| {
            match v.as_str() {
                Some(s) if s.len() >= 3 => Validity::Valid,
                Some(_) => Validity::from("too short"),
                None => Validity::Invalid,
            }
        });
        let values = Map::new();
        let view = SettingsView::new("P", &values);

        assert!(schema.check(&view, &json!("good")).is_ok());
        match schema.check(&view, &json!("ab")) {
            Err(SettingsError::Validation(msg)) => assert_eq!(msg, "too short"),
            other => panic!("unexpected: {other:?}"),
        }
        match schema.check(&view, &json!(1)) {
            Err(SettingsError::Validation(msg)) => assert_eq!(msg, GENERIC_INVALID_MESSAGE),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_cross_field_validation() {
        let schema = OptionSchema::number("Max").validate_with(|view, v: &Value| {
            let min = view.get_f64("min").unwrap_or(0.0);
            v.as_f64().map_or(false, |max| max >= min)
        });
        let mut values = Map::new();
        values.insert("min".to_string(), json!(10));
        let view = SettingsView::new("P", &values);

        assert!(schema.check(&view, &json!(5)).is_err());
        assert!(schema.check(&view, &json!(15)).is_ok());
    }

    #[test]
    fn test_migrate_legacy_separators() {
        let default = OptionSchema::array("Words");
        assert_eq!(
            default.migrate_legacy(Some(&json!("a,b"))).unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let pattern = OptionSchema::array("Words")
            .separator(Separator::Pattern(Regex::new(r"\s*;\s*").unwrap()));
        assert_eq!(
            pattern.migrate_legacy(Some(&json!("a ; b;c"))).unwrap(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );

        let custom = OptionSchema::array("Words").separator(Separator::Custom(Arc::new(
            |s: &str| -> anyhow::Result<Vec<String>> { Ok(s.chars().map(|c| c.to_string()).collect()) },
        )));
        assert_eq!(
            custom.migrate_legacy(Some(&json!("xy"))).unwrap(),
            Some(vec!["x".to_string(), "y".to_string()])
        );
    }

    #[test]
    fn test_migrate_legacy_is_noop_on_lists() {
        let schema = OptionSchema::array("Words");
        assert_eq!(schema.migrate_legacy(Some(&json!(["a"]))).unwrap(), None);
        assert_eq!(schema.migrate_legacy(None).unwrap(), None);
        assert!(schema.migrate_legacy(Some(&json!(3))).is_err());
    }
}
