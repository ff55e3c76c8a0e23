//! Plugin lifecycle manager.
//!
//! Owns the registered descriptors and the registries their running state
//! feeds (patch engine, commands, message listeners). Per plugin:
//!
//! ```text
//! Registered (disabled) -> Starting -> Running -> Stopping -> Registered
//! ```
//!
//! Patches are baked into modules when the host defines them, so enabling or
//! disabling a patched plugin after [`PluginManager::init`] only flips its
//! stored flag and marks it as waiting for a restart.

use crate::commands::CommandRegistry;
use crate::config::EngineConfig;
use crate::error::LifecycleError;
use crate::events::MessageEventRegistry;
use crate::patcher::{LoadReport, PatchEngine};
use crate::plugin::{PluginDescriptor, StartAt};
use crate::settings::Settings;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Plugin providing the command registry to others.
pub const COMMANDS_API: &str = "CommandsAPI";
/// Plugin providing message listeners to others.
pub const MESSAGE_EVENTS_API: &str = "MessageEventsAPI";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginState {
    /// Registered but not running
    Registered,
    Starting,
    Running,
    Stopping,
}

/// Whether the host already defined its modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Boot,
    Loaded,
}

/// Result of recursively starting a plugin's dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyStart {
    /// A dependency carries patches and was only flagged enabled
    pub restart_needed: bool,
    /// Dependencies that could not be started
    pub failures: Vec<String>,
}

/// What an enable/disable request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Started,
    Stopped,
    /// Only the stored flag changed
    FlagOnly,
    /// The flag changed but the effect needs a restart
    RestartRequired,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerSummary {
    pub total: usize,
    pub enabled: usize,
    pub running: usize,
    pub pending_restart: usize,
}

struct PluginEntry {
    descriptor: PluginDescriptor,
    state: PluginState,
    /// Enabled because an enabled plugin depends on it
    is_dependency: bool,
}

pub struct PluginManager {
    config: EngineConfig,
    settings: Settings,
    engine: PatchEngine,
    commands: CommandRegistry,
    events: MessageEventRegistry,
    plugins: Vec<PluginEntry>,
    phase: Phase,
}

impl PluginManager {
    /// Creates a manager, opening `settings_path` if the config names one.
    pub fn new(config: EngineConfig) -> Result<Self, LifecycleError> {
        let settings = match &config.settings_path {
            Some(path) => Settings::open(path)?,
            None => Settings::in_memory(),
        };
        Ok(Self::with_settings(config, settings))
    }

    pub fn with_settings(config: EngineConfig, settings: Settings) -> Self {
        Self {
            engine: PatchEngine::new(config.clone()),
            config,
            settings,
            commands: CommandRegistry::new(),
            events: MessageEventRegistry::new(),
            plugins: Vec::new(),
            phase: Phase::Boot,
        }
    }

    /// Replaces the command registry, e.g. with one that knows the host's
    /// built-in commands.
    pub fn with_commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = commands;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn events(&self) -> &MessageEventRegistry {
        &self.events
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    fn position(&self, name: &str) -> Result<usize, LifecycleError> {
        self.plugins
            .iter()
            .position(|p| p.descriptor.name == name)
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))
    }

    fn entry(&self, name: &str) -> Result<&PluginEntry, LifecycleError> {
        let index = self.position(name)?;
        Ok(&self.plugins[index])
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut PluginEntry, LifecycleError> {
        let index = self.position(name)?;
        Ok(&mut self.plugins[index])
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    pub fn descriptor(&self, name: &str) -> Option<&PluginDescriptor> {
        self.entry(name).ok().map(|e| &e.descriptor)
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.entry(name).ok().map(|e| e.state)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state(name) == Some(PluginState::Running)
    }

    /// Registered plugin names in registration order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.descriptor.name.clone()).collect()
    }

    /// Registers a descriptor. Returns `Ok(false)` when its target excludes
    /// the current environment.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<bool, LifecycleError> {
        if !descriptor.target.applies_to(self.config.environment) {
            debug!(plugin = %descriptor.name, "Skipping plugin for other environment");
            return Ok(false);
        }
        if self.is_registered(&descriptor.name) {
            return Err(LifecycleError::AlreadyRegistered(descriptor.name));
        }

        self.settings.register_plugin(
            &descriptor.name,
            &descriptor.options,
            descriptor.required,
            descriptor.enabled_by_default,
        );
        debug!(plugin = %descriptor.name, patches = descriptor.patches.len(), "Registered plugin");
        self.plugins.push(PluginEntry {
            descriptor,
            state: PluginState::Registered,
            is_dependency: false,
        });
        Ok(true)
    }

    /// Stops (if running) and removes a plugin.
    pub fn unregister(&mut self, name: &str) -> Result<PluginDescriptor, LifecycleError> {
        if self.is_running(name) {
            if let Err(e) = self.stop_plugin(name) {
                warn!(plugin = %name, error = %e, "Stop failed during unregister");
            }
        }
        let index = self.position(name)?;
        self.engine.remove_plugin_patches(name);
        Ok(self.plugins.remove(index).descriptor)
    }

    /// `required || is_dependency || stored enabled flag`.
    pub fn is_enabled(&self, name: &str) -> bool {
        match self.entry(name) {
            Ok(entry) => {
                entry.descriptor.required
                    || entry.is_dependency
                    || self.settings.is_enabled_flag(name)
            }
            Err(_) => false,
        }
    }

    /// Boot step run before the host defines its modules: wires implicit API
    /// dependencies, force-enables every dependency of an enabled plugin and
    /// hands the patches of enabled plugins to the engine.
    ///
    /// A plugin whose dependencies cannot be resolved keeps its dependencies
    /// untouched and contributes no patches; the others load normally. The
    /// returned errors name those plugins.
    pub fn init(&mut self) -> Vec<LifecycleError> {
        let has_commands_api = self.is_registered(COMMANDS_API);
        let has_events_api = self.is_registered(MESSAGE_EVENTS_API);
        for entry in &mut self.plugins {
            let descriptor = &mut entry.descriptor;
            if has_commands_api && !descriptor.commands.is_empty() {
                add_dependency(descriptor, COMMANDS_API);
            }
            if has_events_api && !descriptor.listeners.is_empty() {
                add_dependency(descriptor, MESSAGE_EVENTS_API);
            }
        }

        let enabled: Vec<String> = self
            .plugins
            .iter()
            .map(|p| p.descriptor.name.clone())
            .filter(|name| self.is_enabled(name))
            .collect();
        let mut failures = Vec::new();
        let mut unresolved = Vec::new();
        for name in &enabled {
            if let Err(e) = self.force_dependencies(name) {
                error!(plugin = %name, error = %e, "Failed to resolve dependencies, skipping patches");
                unresolved.push(name.clone());
                failures.push(e);
            }
        }

        let mut patch_count = 0;
        for index in 0..self.plugins.len() {
            let name = self.plugins[index].descriptor.name.clone();
            if !self.is_enabled(&name) || unresolved.contains(&name) {
                continue;
            }
            for rule in self.plugins[index].descriptor.patches.clone() {
                self.engine.add_patch(&name, rule);
                patch_count += 1;
            }
        }

        self.phase = Phase::Loaded;
        info!(plugins = self.plugins.len(), patches = patch_count, "Plugin manager initialized");
        failures
    }

    /// Flags every transitive dependency of `name` enabled. Nothing changes
    /// unless the whole dependency tree resolves.
    fn force_dependencies(&mut self, name: &str) -> Result<(), LifecycleError> {
        let mut forced = Vec::new();
        self.collect_forced(name, &mut vec![name.to_string()], &mut forced)?;
        for dependency in forced {
            self.entry_mut(&dependency)?.is_dependency = true;
            self.settings.set_enabled(&dependency, true)?;
        }
        Ok(())
    }

    fn collect_forced(&self, name: &str, stack: &mut Vec<String>, forced: &mut Vec<String>) -> Result<(), LifecycleError> {
        for dependency in &self.entry(name)?.descriptor.dependencies {
            if stack.contains(dependency) {
                return Err(cycle(stack, dependency));
            }
            let Ok(entry) = self.entry(dependency) else {
                if self.config.dev_mode {
                    return Err(LifecycleError::UnresolvedDependency {
                        plugin: name.to_string(),
                        dependency: dependency.clone(),
                    });
                }
                warn!(plugin = %name, dependency = %dependency, "Unresolved dependency");
                continue;
            };
            if entry.is_dependency || forced.contains(dependency) {
                continue;
            }
            forced.push(dependency.clone());

            stack.push(dependency.clone());
            self.collect_forced(dependency, stack, forced)?;
            stack.pop();
        }
        Ok(())
    }

    /// Starts every enabled plugin of `stage` in registration order, each
    /// after its dependencies. Returns the failures; they do not stop the
    /// remaining plugins.
    pub fn start_all(&mut self, stage: StartAt) -> Vec<LifecycleError> {
        let candidates: Vec<String> = self
            .plugins
            .iter()
            .filter(|p| p.descriptor.start_at == stage && p.state == PluginState::Registered)
            .map(|p| p.descriptor.name.clone())
            .filter(|name| self.is_enabled(name))
            .collect();

        let mut failures = Vec::new();
        for name in candidates {
            if self.is_running(&name) {
                continue;
            }
            let mut outcome = DependencyStart::default();
            if let Err(e) = self.start_dependencies(&name, false, &mut vec![name.clone()], &mut outcome) {
                error!(plugin = %name, error = %e, "Failed to resolve dependencies");
                failures.push(e);
                continue;
            }
            if !outcome.failures.is_empty() {
                let e = LifecycleError::DependencyStartFailure {
                    plugin: name.clone(),
                    failed: outcome.failures,
                };
                error!(plugin = %name, error = %e, "Not starting plugin");
                failures.push(e);
                continue;
            }
            if let Err(e) = self.start_plugin(&name) {
                failures.push(e);
            }
        }
        failures
    }

    /// Runs a plugin's `start` hook, then registers its commands and message
    /// listeners. A failing hook leaves the plugin stopped.
    pub fn start_plugin(&mut self, name: &str) -> Result<(), LifecycleError> {
        let entry = self.entry_mut(name)?;
        if entry.state != PluginState::Registered {
            return Err(LifecycleError::AlreadyStarted(name.to_string()));
        }
        entry.state = PluginState::Starting;
        let hooks = Arc::clone(&entry.descriptor.hooks);

        debug!(plugin = %name, "Starting plugin");
        if let Err(reason) = run_hook(|| hooks.start()) {
            error!(plugin = %name, error = %reason, "Failed to start plugin");
            self.entry_mut(name)?.state = PluginState::Registered;
            return Err(LifecycleError::StartFailed {
                plugin: name.to_string(),
                reason,
            });
        }

        let entry = self.entry_mut(name)?;
        entry.state = PluginState::Running;
        let commands = entry.descriptor.commands.clone();
        let listeners = entry.descriptor.listeners.clone();

        for command in commands {
            let command_name = command.name.clone();
            if let Err(source) = self.commands.register(command, name) {
                let e = LifecycleError::Command {
                    plugin: name.to_string(),
                    source,
                };
                error!(plugin = %name, command = %command_name, error = %e, "Failed to register command");
            }
        }
        if !listeners.is_empty() {
            self.events.add(name, &listeners);
        }

        info!(plugin = %name, "Started plugin");
        Ok(())
    }

    /// Runs a plugin's `stop` hook and unregisters its commands and
    /// listeners. The plugin ends up stopped even if the hook fails.
    pub fn stop_plugin(&mut self, name: &str) -> Result<(), LifecycleError> {
        let entry = self.entry_mut(name)?;
        if entry.state != PluginState::Running {
            return Err(LifecycleError::AlreadyStopped(name.to_string()));
        }
        entry.state = PluginState::Stopping;
        let hooks = Arc::clone(&entry.descriptor.hooks);

        let result = run_hook(|| hooks.stop());

        let removed = self.commands.unregister_plugin(name);
        self.events.remove(name);
        self.entry_mut(name)?.state = PluginState::Registered;

        match result {
            Ok(()) => {
                info!(plugin = %name, commands = removed, "Stopped plugin");
                Ok(())
            }
            Err(reason) => {
                error!(plugin = %name, error = %reason, "Failed to stop plugin");
                Err(LifecycleError::StopFailed {
                    plugin: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Brings every dependency of `name` to running, dependencies first.
    ///
    /// Dependencies with patches cannot take effect without a restart; they
    /// are flagged enabled and reported through `restart_needed` instead.
    pub fn start_dependencies_recursive(&mut self, name: &str) -> Result<DependencyStart, LifecycleError> {
        self.position(name)?;
        let mut outcome = DependencyStart::default();
        self.start_dependencies(name, true, &mut vec![name.to_string()], &mut outcome)?;
        Ok(outcome)
    }

    /// Returns false if any dependency of `name` is not running or about to
    /// run after a restart.
    fn start_dependencies(
        &mut self,
        name: &str,
        after_load: bool,
        stack: &mut Vec<String>,
        outcome: &mut DependencyStart,
    ) -> Result<bool, LifecycleError> {
        let dependencies = self.entry(name)?.descriptor.dependencies.clone();
        let mut satisfied = true;

        for dependency in dependencies {
            if stack.contains(&dependency) {
                return Err(cycle(stack, &dependency));
            }
            if outcome.failures.contains(&dependency) {
                satisfied = false;
                continue;
            }
            let Ok(entry) = self.entry(&dependency) else {
                warn!(plugin = %name, dependency = %dependency, "Dependency is not registered");
                outcome.failures.push(dependency);
                satisfied = false;
                continue;
            };
            if entry.state == PluginState::Running {
                continue;
            }
            let has_patches = entry.descriptor.has_patches();
            let was_dependency = entry.is_dependency;

            stack.push(dependency.clone());
            let ready = self.start_dependencies(&dependency, after_load, stack, outcome)?;
            stack.pop();
            if !ready {
                outcome.failures.push(dependency);
                satisfied = false;
                continue;
            }

            let was_enabled = self.settings.is_enabled_flag(&dependency);
            self.entry_mut(&dependency)?.is_dependency = true;
            if !was_enabled {
                self.settings.set_enabled(&dependency, true)?;
            }

            if after_load && has_patches {
                info!(plugin = %name, dependency = %dependency, "Dependency has patches, restart needed");
                self.settings.mark_restart_needed(&dependency);
                outcome.restart_needed = true;
                continue;
            }
            if self.start_plugin(&dependency).is_err() {
                self.entry_mut(&dependency)?.is_dependency = was_dependency;
                if !was_enabled {
                    self.settings.set_enabled(&dependency, false)?;
                }
                outcome.failures.push(dependency);
                satisfied = false;
            }
        }
        Ok(satisfied)
    }

    /// Enables a plugin, starting it (and its dependencies) when that can
    /// take effect immediately.
    pub fn enable(&mut self, name: &str) -> Result<ToggleOutcome, LifecycleError> {
        let entry = self.entry(name)?;
        let has_patches = entry.descriptor.has_patches();
        let running = entry.state == PluginState::Running;

        if self.phase == Phase::Boot {
            self.settings.set_enabled(name, true)?;
            return Ok(ToggleOutcome::FlagOnly);
        }
        if running {
            if self.settings.is_enabled_flag(name) {
                return Ok(ToggleOutcome::Unchanged);
            }
            self.settings.set_enabled(name, true)?;
            return Ok(ToggleOutcome::FlagOnly);
        }

        let dependencies = self.start_dependencies_recursive(name)?;
        if !dependencies.failures.is_empty() {
            let e = LifecycleError::DependencyStartFailure {
                plugin: name.to_string(),
                failed: dependencies.failures,
            };
            error!(plugin = %name, error = %e, "Not enabling plugin");
            return Err(e);
        }

        if dependencies.restart_needed || has_patches {
            self.settings.set_enabled(name, true)?;
            self.settings.mark_restart_needed(name);
            info!(plugin = %name, "Enabled plugin, restart needed");
            return Ok(ToggleOutcome::RestartRequired);
        }

        self.start_plugin(name)?;
        self.settings.set_enabled(name, true)?;
        Ok(ToggleOutcome::Started)
    }

    /// Disables a plugin. Required plugins and plugins an enabled plugin
    /// depends on are refused.
    pub fn disable(&mut self, name: &str) -> Result<ToggleOutcome, LifecycleError> {
        let entry = self.entry(name)?;
        if entry.descriptor.required {
            return Err(LifecycleError::Required(name.to_string()));
        }
        let has_patches = entry.descriptor.has_patches();
        let running = entry.state == PluginState::Running;

        let dependents: Vec<String> = self
            .plugins
            .iter()
            .filter(|p| p.descriptor.name != name)
            .filter(|p| p.descriptor.dependencies.iter().any(|d| d == name))
            .map(|p| p.descriptor.name.clone())
            .filter(|dependent| self.is_enabled(dependent))
            .collect();
        if !dependents.is_empty() {
            return Err(LifecycleError::DependencyInUse {
                plugin: name.to_string(),
                dependents,
            });
        }

        self.entry_mut(name)?.is_dependency = false;
        self.settings.set_enabled(name, false)?;

        if self.phase == Phase::Boot {
            return Ok(ToggleOutcome::FlagOnly);
        }
        if has_patches {
            self.settings.mark_restart_needed(name);
            info!(plugin = %name, "Disabled plugin, restart needed");
            return Ok(ToggleOutcome::RestartRequired);
        }
        if !running {
            return Ok(ToggleOutcome::FlagOnly);
        }

        self.stop_plugin(name)?;
        Ok(ToggleOutcome::Stopped)
    }

    pub fn toggle(&mut self, name: &str) -> Result<ToggleOutcome, LifecycleError> {
        if self.is_enabled(name) {
            self.disable(name)
        } else {
            self.enable(name)
        }
    }

    pub fn intercept(&mut self, module_id: &str, source: &str) -> String {
        self.engine.intercept(module_id, source)
    }

    pub fn finish_load(&self) -> LoadReport {
        self.engine.finish_load()
    }

    pub fn summary(&self) -> ManagerSummary {
        ManagerSummary {
            total: self.plugins.len(),
            enabled: self
                .plugins
                .iter()
                .filter(|p| self.is_enabled(&p.descriptor.name))
                .count(),
            running: self
                .plugins
                .iter()
                .filter(|p| p.state == PluginState::Running)
                .count(),
            pending_restart: self.settings.pending_restart().len(),
        }
    }
}

fn add_dependency(descriptor: &mut PluginDescriptor, dependency: &str) {
    if descriptor.name != dependency && !descriptor.dependencies.iter().any(|d| d == dependency) {
        descriptor.dependencies.push(dependency.to_string());
    }
}

fn cycle(stack: &[String], dependency: &str) -> LifecycleError {
    let mut path = stack.to_vec();
    path.push(dependency.to_string());
    LifecycleError::CircularDependency(path.join(" -> "))
}

/// Runs a plugin hook, turning errors and panics into a message.
fn run_hook<F>(hook: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "plugin panicked".to_string())),
    }
}
