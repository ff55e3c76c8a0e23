//! Error types for the patch engine, lifecycle manager, settings and registries.
//!
//! Engine-level failures (patch, dependency, hook) are caught where they happen
//! and logged; they only surface as values of these types to the caller that
//! asked for the operation. Validation failures are returned, never panicked.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while compiling or applying patch rules.
#[derive(Error, Debug)]
pub enum PatchError {
    /// A `find` or `match` pattern did not compile after `\i` expansion
    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A replace callback returned an error
    #[error("Replacement by {plugin} failed: {message}")]
    ReplaceFailed { plugin: String, message: String },

    /// A structured rule definition could not be parsed
    #[error("Invalid rule definition: {0}")]
    Definition(#[from] serde_json::Error),
}

/// Errors raised by the plugin lifecycle manager.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Plugin '{0}' not found")]
    NotFound(String),

    #[error("Plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Plugin '{0}' is already started")]
    AlreadyStarted(String),

    #[error("Plugin '{0}' is already stopped")]
    AlreadyStopped(String),

    /// Recursive activation could not bring every dependency to `Running`
    #[error("Failed to start dependencies of {plugin}: {}", failed.join(", "))]
    DependencyStartFailure { plugin: String, failed: Vec<String> },

    /// A dependency named by a descriptor is not registered (strict mode only)
    #[error("Plugin {plugin} has unresolved dependency {dependency}")]
    UnresolvedDependency { plugin: String, dependency: String },

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    /// The plugin's `start()` hook failed or panicked
    #[error("Failed to start {plugin}: {reason}")]
    StartFailed { plugin: String, reason: String },

    /// The plugin's `stop()` hook failed or panicked
    #[error("Failed to stop {plugin}: {reason}")]
    StopFailed { plugin: String, reason: String },

    #[error("Plugin '{0}' is required and cannot be disabled")]
    Required(String),

    #[error("Plugin '{plugin}' is needed by {}", dependents.join(", "))]
    DependencyInUse {
        plugin: String,
        dependents: Vec<String>,
    },

    #[error("Command registration failed for {plugin}: {source}")]
    Command {
        plugin: String,
        #[source]
        source: CommandError,
    },

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// Errors raised by the settings store and option validation.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Plugin '{0}' has no settings")]
    UnknownPlugin(String),

    #[error("Plugin '{plugin}' has no option '{option}'")]
    UnknownOption { plugin: String, option: String },

    /// `is_valid` rejected the value; carries the message shown to the user
    #[error("{0}")]
    Validation(String),

    /// The value cannot be coerced to the option's declared type
    #[error("Option '{option}' expects {expected}, got {found}")]
    TypeMismatch {
        option: String,
        expected: &'static str,
        found: String,
    },

    /// A legacy value could not be migrated to its current shape
    #[error("Failed to migrate option '{option}' of plugin {plugin}: {reason}")]
    Migration {
        plugin: String,
        option: String,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the command registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command '{0}' is already registered")]
    Duplicate(String),

    #[error("Command '{0}' collides with a built-in command")]
    BuiltIn(String),

    #[error("Command '{0}' not found")]
    NotFound(String),

    /// A message option was referenced before the host data resolved it
    #[error("Message option for command '{0}' is not resolved yet")]
    Unresolved(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_failure_lists_names() {
        let err = LifecycleError::DependencyStartFailure {
            plugin: "A".to_string(),
            failed: vec!["B".to_string(), "C".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("A"));
        assert!(msg.contains("B, C"));
    }

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = SettingsError::Validation("too short".to_string());
        assert_eq!(err.to_string(), "too short");
    }

    #[test]
    fn test_invalid_pattern_display() {
        let source = regex::Regex::new("(").unwrap_err();
        let err = PatchError::InvalidPattern {
            pattern: "(".to_string(),
            source,
        };
        assert!(err.to_string().contains("Invalid pattern"));
    }

    #[test]
    fn test_store_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SettingsError = StoreError::from(json_err).into();
        assert!(matches!(err, SettingsError::Store(StoreError::Json(_))));
    }
}
