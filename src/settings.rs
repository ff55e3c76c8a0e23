//! Process-wide plugin settings.
//!
//! [`Settings`] is a cheaply cloneable handle over the stored values of every
//! plugin, the option schemas they declared and the set of plugins waiting for
//! a restart. Every committed write is persisted through the configured
//! [`KeyValueStore`] and bumps `settings.syncVersion`.
//!
//! Validators and change listeners are plugin code; they are always called
//! with the internal lock released.

use crate::error::{SettingsError, StoreError};
use crate::options::{OptionSchema, OptionType, SettingsView};
use crate::persistence::{JsonFileStore, KeyValueStore, MemoryStore};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Store key prefix of per-plugin settings.
pub const PLUGIN_KEY_PREFIX: &str = "plugins.";
pub const SYNC_VERSION_KEY: &str = "settings.syncVersion";
/// Reserved field holding the enabled flag of a plugin.
pub const ENABLED_FIELD: &str = "enabled";

pub type SettingsListener = Arc<dyn Fn(&Value, &str) + Send + Sync>;

/// Handle returned by [`Settings::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// What a committed `set_option` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetOutcome {
    /// False when the value was identical to the stored one
    pub changed: bool,
    /// The option only takes effect after a restart
    pub restart_needed: bool,
}

/// Options and enablement defaults a plugin registered.
#[derive(Debug, Clone, Default)]
struct PluginSchema {
    options: BTreeMap<String, OptionSchema>,
    required: bool,
    enabled_by_default: bool,
}

struct State {
    store: Arc<dyn KeyValueStore>,
    values: BTreeMap<String, Map<String, Value>>,
    schemas: BTreeMap<String, PluginSchema>,
    listeners: Vec<(ListenerHandle, String, SettingsListener)>,
    next_listener: u64,
    pending_restart: BTreeSet<String>,
    sync_version: i64,
}

impl State {
    fn default_of(&self, plugin: &str, option: &str) -> Option<Value> {
        let schema = self.schemas.get(plugin)?;
        if option == ENABLED_FIELD {
            return Some(Value::Bool(schema.required || schema.enabled_by_default));
        }
        schema.options.get(option)?.default_value()
    }

    fn get(&self, plugin: &str, option: &str) -> Option<Value> {
        self.values
            .get(plugin)
            .and_then(|values| values.get(option).cloned())
            .or_else(|| self.default_of(plugin, option))
    }

    /// Stored values overlaid on defaults.
    fn effective(&self, plugin: &str) -> Map<String, Value> {
        let mut merged = Map::new();
        if let Some(schema) = self.schemas.get(plugin) {
            for (id, option) in &schema.options {
                if let Some(default) = option.default_value() {
                    merged.insert(id.clone(), default);
                }
            }
        }
        if let Some(values) = self.values.get(plugin) {
            for (id, value) in values {
                merged.insert(id.clone(), value.clone());
            }
        }
        merged
    }

    /// Writes `next` as the values of `plugin`. Memory is only updated once
    /// the store accepted the write.
    fn store_values(&mut self, plugin: &str, next: Option<Map<String, Value>>) -> Result<(), StoreError> {
        let key = format!("{}{}", PLUGIN_KEY_PREFIX, plugin);
        match next {
            Some(values) => {
                self.store.set(&key, Value::Object(values.clone()))?;
                self.values.insert(plugin.to_string(), values);
            }
            None => {
                self.store.del(&key)?;
                self.values.remove(plugin);
            }
        }

        let version = chrono::Utc::now().timestamp_millis().max(self.sync_version + 1);
        match self.store.set(SYNC_VERSION_KEY, Value::from(version)) {
            Ok(()) => self.sync_version = version,
            Err(e) => warn!(error = %e, "Failed to store settings sync version"),
        }
        Ok(())
    }

    fn listeners_for(&self, path: &str) -> Vec<SettingsListener> {
        self.listeners
            .iter()
            .filter(|(_, watched, _)| path_matches(watched, path))
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect()
    }
}

fn path_matches(watched: &str, path: &str) -> bool {
    watched.is_empty()
        || watched == path
        || path
            .strip_prefix(watched)
            .map_or(false, |rest| rest.starts_with('.'))
}

fn option_path(plugin: &str, option: &str) -> String {
    format!("{}{}.{}", PLUGIN_KEY_PREFIX, plugin, option)
}

fn notify(listeners: Vec<SettingsListener>, value: &Value, path: &str) {
    for listener in listeners {
        listener(value, path);
    }
}

/// Shared settings handle.
#[derive(Clone)]
pub struct Settings {
    inner: Arc<RwLock<State>>,
}

impl Settings {
    /// Loads every `plugins.*` entry from `store`. An unreadable store is
    /// logged and treated as empty.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let (values, sync_version) = match read_all(store.as_ref()) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "Failed to read settings, starting from defaults");
                (BTreeMap::new(), 0)
            }
        };

        Self {
            inner: Arc::new(RwLock::new(State {
                store,
                values,
                schemas: BTreeMap::new(),
                listeners: Vec::new(),
                next_listener: 1,
                pending_restart: BTreeSet::new(),
                sync_version,
            })),
        }
    }

    pub fn in_memory() -> Self {
        Self::load(Arc::new(MemoryStore::new()))
    }

    /// Opens a JSON settings file. A corrupt file is logged and replaced by
    /// empty settings on the next write.
    pub fn open(path: &Path) -> Result<Self, SettingsError> {
        let store = match JsonFileStore::open(path) {
            Ok(store) => store,
            Err(StoreError::Corrupt { path, source }) => {
                error!(path = %path.display(), error = %source, "Settings file is corrupt, starting from defaults");
                JsonFileStore::empty(path)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::load(Arc::new(store)))
    }

    /// Declares the options of a plugin and hooks up their `on_change`
    /// callbacks. Registering again replaces the schema.
    pub fn register_plugin(
        &self,
        plugin: &str,
        options: &BTreeMap<String, OptionSchema>,
        required: bool,
        enabled_by_default: bool,
    ) {
        let mut state = self.inner.write();
        state.schemas.insert(
            plugin.to_string(),
            PluginSchema {
                options: options.clone(),
                required,
                enabled_by_default,
            },
        );

        for (id, option) in options {
            if let Some(on_change) = &option.on_change {
                let handle = ListenerHandle(state.next_listener);
                state.next_listener += 1;
                state
                    .listeners
                    .push((handle, option_path(plugin, id), Arc::clone(on_change)));
            }
        }
    }

    pub fn schema(&self, plugin: &str, option: &str) -> Option<OptionSchema> {
        self.inner
            .read()
            .schemas
            .get(plugin)
            .and_then(|schema| schema.options.get(option).cloned())
    }

    /// Options a settings screen should list, in id order. Hidden options
    /// stay readable and writable.
    pub fn visible_options(&self, plugin: &str) -> Vec<(String, OptionSchema)> {
        self.inner
            .read()
            .schemas
            .get(plugin)
            .map(|schema| {
                schema
                    .options
                    .iter()
                    .filter(|(_, option)| !option.hidden)
                    .map(|(id, option)| (id.clone(), option.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current value of an option, falling back to its default.
    pub fn get(&self, plugin: &str, option: &str) -> Option<Value> {
        self.inner.read().get(plugin, option)
    }

    /// Every option of a plugin, stored values overlaid on defaults.
    pub fn plugin_values(&self, plugin: &str) -> Map<String, Value> {
        self.inner.read().effective(plugin)
    }

    /// Stored enabled flag, or `required || enabled_by_default` when unset.
    pub fn is_enabled_flag(&self, plugin: &str) -> bool {
        self.get(plugin, ENABLED_FIELD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_enabled(&self, plugin: &str, enabled: bool) -> Result<(), SettingsError> {
        self.commit(plugin, ENABLED_FIELD, Value::Bool(enabled)).map(|_| ())
    }

    /// Validates, coerces and commits an option value.
    ///
    /// A validator rejection is returned as [`SettingsError::Validation`] with
    /// the store left untouched.
    pub fn set_option(&self, plugin: &str, option: &str, candidate: Value) -> Result<SetOutcome, SettingsError> {
        let (schema, current) = {
            let state = self.inner.read();
            let plugin_schema = state
                .schemas
                .get(plugin)
                .ok_or_else(|| SettingsError::UnknownPlugin(plugin.to_string()))?;
            let schema = plugin_schema
                .options
                .get(option)
                .cloned()
                .ok_or_else(|| SettingsError::UnknownOption {
                    plugin: plugin.to_string(),
                    option: option.to_string(),
                })?;
            (schema, state.effective(plugin))
        };

        schema.check(&SettingsView::new(plugin, &current), &candidate)?;
        let value = schema.coerce(option, candidate)?;

        let changed = self.commit(plugin, option, value)?;
        let restart_needed = changed && schema.restart_needed;
        if restart_needed {
            self.mark_restart_needed(plugin);
        }
        Ok(SetOutcome {
            changed,
            restart_needed,
        })
    }

    /// Writes a value without validation. Returns false if it was identical.
    pub fn set_raw(&self, plugin: &str, option: &str, value: Value) -> Result<bool, SettingsError> {
        self.commit(plugin, option, value)
    }

    fn commit(&self, plugin: &str, option: &str, value: Value) -> Result<bool, SettingsError> {
        let path = option_path(plugin, option);
        let listeners = {
            let mut state = self.inner.write();
            let unchanged = state
                .values
                .get(plugin)
                .and_then(|values| values.get(option))
                .map_or(false, |stored| *stored == value);
            if unchanged {
                return Ok(false);
            }

            let mut next = state.values.get(plugin).cloned().unwrap_or_default();
            next.insert(option.to_string(), value.clone());
            state.store_values(plugin, Some(next))?;
            state.listeners_for(&path)
        };

        debug!(path = %path, "Setting changed");
        notify(listeners, &value, &path);
        Ok(true)
    }

    /// Reads a list option, migrating a legacy delimited string first.
    ///
    /// The migrated list is written back, so a second read finds a list and
    /// leaves it untouched.
    pub fn get_array(&self, plugin: &str, option: &str) -> Result<Vec<String>, SettingsError> {
        let schema = self.schema(plugin, option).ok_or_else(|| SettingsError::UnknownOption {
            plugin: plugin.to_string(),
            option: option.to_string(),
        })?;
        if schema.kind != OptionType::Array {
            return Err(SettingsError::TypeMismatch {
                option: option.to_string(),
                expected: "a list option",
                found: format!("{:?} option", schema.kind),
            });
        }

        let stored = self
            .inner
            .read()
            .values
            .get(plugin)
            .and_then(|values| values.get(option).cloned());

        let migrated = schema
            .migrate_legacy(stored.as_ref())
            .map_err(|e| SettingsError::Migration {
                plugin: plugin.to_string(),
                option: option.to_string(),
                reason: format!("{:#}", e),
            })?;

        let list = match migrated {
            Some(list) => {
                info!(plugin = %plugin, option = %option, items = list.len(), "Migrated legacy list setting");
                let value = Value::from(list.clone());
                self.commit(plugin, option, value)?;
                list
            }
            None => self
                .get(plugin, option)
                .and_then(|v| match v {
                    Value::Array(items) => Some(
                        items
                            .into_iter()
                            .filter_map(|item| item.as_str().map(str::to_string))
                            .collect(),
                    ),
                    _ => None,
                })
                .unwrap_or_default(),
        };
        Ok(list)
    }

    /// Restores every option of a plugin to its default. The enabled flag is
    /// kept. Returns true if a reset option needs a restart.
    pub fn reset_plugin(&self, plugin: &str) -> Result<bool, SettingsError> {
        let mut notifications = Vec::new();
        let mut restart_needed = false;
        {
            let mut state = self.inner.write();
            let schema = state
                .schemas
                .get(plugin)
                .cloned()
                .ok_or_else(|| SettingsError::UnknownPlugin(plugin.to_string()))?;
            let Some(mut values) = state.values.get(plugin).cloned() else {
                return Ok(false);
            };

            let mut removed = Vec::new();
            values.retain(|id, _| {
                let keep = id == ENABLED_FIELD;
                if !keep {
                    removed.push(id.clone());
                }
                keep
            });
            if removed.is_empty() {
                return Ok(false);
            }
            state.store_values(plugin, Some(values))?;

            for id in removed {
                let option = schema.options.get(&id);
                restart_needed |= option.map_or(false, |o| o.restart_needed);
                let value = option.and_then(OptionSchema::default_value).unwrap_or(Value::Null);
                let path = option_path(plugin, &id);
                notifications.push((state.listeners_for(&path), value, path));
            }
            if restart_needed {
                state.pending_restart.insert(plugin.to_string());
            }
        }

        info!(plugin = %plugin, restart_needed, "Reset plugin settings");
        for (listeners, value, path) in notifications {
            notify(listeners, &value, &path);
        }
        Ok(restart_needed)
    }

    /// Moves settings stored under an old plugin name to `plugin`. Does
    /// nothing if `plugin` already has settings. Returns true if anything moved.
    pub fn migrate_plugin_settings(&self, plugin: &str, old_names: &[&str]) -> Result<bool, SettingsError> {
        let mut state = self.inner.write();
        if state.values.contains_key(plugin) {
            return Ok(false);
        }

        for old in old_names {
            if let Some(values) = state.values.get(*old).cloned() {
                info!(from = %old, to = %plugin, "Migrating plugin settings");
                state.store_values(plugin, Some(values))?;
                state.store_values(old, None)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Registers a listener on `plugins.<Name>.<option>`, a prefix of it, or
    /// `""` for every change.
    pub fn add_listener<F>(&self, path: impl Into<String>, listener: F) -> ListenerHandle
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        let mut state = self.inner.write();
        let handle = ListenerHandle(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((handle, path.into(), Arc::new(listener)));
        handle
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut state = self.inner.write();
        let before = state.listeners.len();
        state.listeners.retain(|(h, _, _)| *h != handle);
        state.listeners.len() != before
    }

    pub fn mark_restart_needed(&self, plugin: &str) {
        self.inner.write().pending_restart.insert(plugin.to_string());
    }

    pub fn is_restart_pending(&self, plugin: &str) -> bool {
        self.inner.read().pending_restart.contains(plugin)
    }

    pub fn pending_restart(&self) -> Vec<String> {
        self.inner.read().pending_restart.iter().cloned().collect()
    }

    pub fn sync_version(&self) -> i64 {
        self.inner.read().sync_version
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("Settings")
            .field("plugins", &state.values.keys().collect::<Vec<_>>())
            .field("pending_restart", &state.pending_restart)
            .field("sync_version", &state.sync_version)
            .finish()
    }
}

type Loaded = (BTreeMap<String, Map<String, Value>>, i64);

fn read_all(store: &dyn KeyValueStore) -> Result<Loaded, StoreError> {
    let mut plugins = BTreeMap::new();
    for key in store.keys()? {
        let Some(name) = key.strip_prefix(PLUGIN_KEY_PREFIX) else {
            continue;
        };
        match store.get(&key)? {
            Some(Value::Object(values)) => {
                plugins.insert(name.to_string(), values);
            }
            Some(other) => error!(key = %key, value = %other, "Ignoring malformed plugin settings"),
            None => {}
        }
    }

    let version = store
        .get(SYNC_VERSION_KEY)?
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    Ok((plugins, version))
}
