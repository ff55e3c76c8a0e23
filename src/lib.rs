//! Patchcord Core Library
//!
//! Core of a client modification framework: rewrites the host application's
//! bundled modules before they run and manages the plugins contributing those
//! rewrites.
//!
//! # Architecture
//!
//! The host's module loader calls into the engine for every module it is
//! about to define, either directly from Rust or through the C ABI in
//! [`ffi`]. Plugins are static descriptors registered at boot.
//!
//! # Core Features Implemented
//!
//! ## Patch Engine (`patches`, `patcher` modules)
//! - `PatchRule` - find/replace rules with `\i` identifier escapes and `$self`
//! - `PatchEngine::intercept()` - Apply rules to one module's source
//! - `PatchEngine::finish_load()` - Report unmatched, failing and ambiguous rules
//!
//! ## Plugin Lifecycle (`plugin`, `manager` modules)
//! - `PluginDescriptor` - Metadata, patches, options, commands, hooks
//! - `PluginManager::init()` - Force-enable dependencies, hand patches to the engine
//! - `PluginManager::start_all()` - Start enabled plugins per boot stage
//! - `PluginManager::enable()` / `disable()` / `toggle()` - With restart tracking
//! - `PluginManager::start_dependencies_recursive()`
//!
//! ## Settings (`options`, `settings`, `persistence` modules)
//! - `OptionSchema` - Typed options with validators and legacy separators
//! - `Settings::set_option()` - Validate, coerce, commit, notify
//! - `Settings::get_array()` - Read list options, migrating legacy strings
//! - `KeyValueStore` - In-memory and JSON file backends
//!
//! ## Registries (`commands`, `events` modules)
//! - `CommandRegistry` - Plugin slash commands with deferred message options
//! - `MessageEventRegistry` - Pre-send, pre-edit and click listeners
//!
//! ## Tooling (`schema`, `helper`, `config` modules)
//! - `parse_rules_json()` - Rules as data
//! - `preview()` - Try one match/replace against a module
//! - `EngineConfig` - TOML configuration

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod ffi;
pub mod helper;
pub mod manager;
pub mod options;
pub mod patcher;
pub mod patches;
pub mod persistence;
pub mod plugin;
pub mod schema;
pub mod settings;

pub use config::EngineConfig;
pub use error::{CommandError, LifecycleError, PatchError, SettingsError, StoreError};
pub use manager::{DependencyStart, PluginManager, PluginState, ToggleOutcome};
pub use options::{OptionSchema, OptionType, SelectOption, Separator, SettingsView, Validity};
pub use patcher::{LoadReport, PatchEngine, PatchMatchFailure};
pub use patches::{Find, Match, PatchRule, Replace, Replacement};
pub use plugin::{Environment, FnHooks, PluginDescriptor, PluginHooks, PluginTarget, StartAt};
pub use settings::Settings;
