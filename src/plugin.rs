use crate::commands::CommandDef;
use crate::events::MessageListeners;
use crate::options::OptionSchema;
use crate::patches::PatchRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Host environment the engine runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Web,
    #[default]
    Desktop,
}

/// Environments a plugin applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginTarget {
    Web,
    Desktop,
    #[default]
    Both,
}

impl PluginTarget {
    pub fn applies_to(&self, environment: Environment) -> bool {
        match self {
            PluginTarget::Both => true,
            PluginTarget::Web => environment == Environment::Web,
            PluginTarget::Desktop => environment == Environment::Desktop,
        }
    }
}

/// Boot stage at which a plugin is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum StartAt {
    /// As soon as the engine is initialized
    Init,
    /// Once the host document is ready
    DomReady,
    /// Once the host's module loader is ready
    #[default]
    LoaderReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub id: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }
}

/// Start/stop hooks of a plugin. `stop` must undo whatever `start` set up.
pub trait PluginHooks: Send + Sync {
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Plugin without hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl PluginHooks for NoHooks {}

type HookFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Hooks built from closures.
#[derive(Default)]
pub struct FnHooks {
    start: Option<HookFn>,
    stop: Option<HookFn>,
}

impl FnHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.start = Some(Box::new(f));
        self
    }

    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.stop = Some(Box::new(f));
        self
    }
}

impl PluginHooks for FnHooks {
    fn start(&self) -> anyhow::Result<()> {
        self.start.as_ref().map_or(Ok(()), |f| f())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.stop.as_ref().map_or(Ok(()), |f| f())
    }
}

/// Static definition of a plugin.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub description: String,
    pub authors: Vec<Author>,
    pub patches: Vec<PatchRule>,
    pub commands: Vec<CommandDef>,
    pub options: BTreeMap<String, OptionSchema>,
    pub dependencies: Vec<String>,
    pub required: bool,
    pub enabled_by_default: bool,
    pub target: PluginTarget,
    pub start_at: StartAt,
    pub listeners: MessageListeners,
    pub hooks: Arc<dyn PluginHooks>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            authors: Vec::new(),
            patches: Vec::new(),
            commands: Vec::new(),
            options: BTreeMap::new(),
            dependencies: Vec::new(),
            required: false,
            enabled_by_default: false,
            target: PluginTarget::Both,
            start_at: StartAt::LoaderReady,
            listeners: MessageListeners::default(),
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn author(mut self, author: Author) -> Self {
        self.authors.push(author);
        self
    }

    pub fn patch(mut self, rule: PatchRule) -> Self {
        self.patches.push(rule);
        self
    }

    pub fn command(mut self, command: CommandDef) -> Self {
        self.commands.push(command);
        self
    }

    pub fn option(mut self, id: impl Into<String>, schema: OptionSchema) -> Self {
        self.options.insert(id.into(), schema);
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn enabled_by_default(mut self) -> Self {
        self.enabled_by_default = true;
        self
    }

    pub fn target(mut self, target: PluginTarget) -> Self {
        self.target = target;
        self
    }

    pub fn start_at(mut self, stage: StartAt) -> Self {
        self.start_at = stage;
        self
    }

    pub fn listeners(mut self, listeners: MessageListeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn hooks(mut self, hooks: impl PluginHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Changing the enabled state of a patched plugin needs a restart.
    pub fn has_patches(&self) -> bool {
        !self.patches.is_empty()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("authors", &self.authors)
            .field("patches", &self.patches.len())
            .field("commands", &self.commands.len())
            .field("options", &self.options.keys().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .field("required", &self.required)
            .field("target", &self.target)
            .field("start_at", &self.start_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_filter() {
        assert!(PluginTarget::Both.applies_to(Environment::Web));
        assert!(PluginTarget::Desktop.applies_to(Environment::Desktop));
        assert!(!PluginTarget::Desktop.applies_to(Environment::Web));
    }

    #[test]
    fn test_fn_hooks() {
        let hooks = FnHooks::new().on_start(|| anyhow::bail!("no network"));
        assert!(hooks.start().is_err());
        assert!(hooks.stop().is_ok());
    }
}
