//! Command registry.
//!
//! Holds the slash commands contributed by running plugins. Commands are keyed
//! by name; the registry assigns ids and the owning plugin on registration and
//! rejects names that collide with built-in or already registered commands.
//!
//! The host's "message" option is only known once the host finishes loading.
//! Commands reference it through [`OptionSpec::Message`], which resolves
//! through a once-settable cell instead of being swapped in later.

use crate::error::CommandError;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Application id given to every plugin command.
pub const PLUGIN_APPLICATION_ID: &str = "-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOptionType {
    String,
    Integer,
    Number,
    Boolean,
    User,
    Channel,
    Role,
    Attachment,
}

/// A concrete argument slot of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOption {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: CommandOptionType,
    #[serde(default)]
    pub required: bool,
}

impl CommandOption {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: CommandOptionType) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// An argument slot as declared by a plugin.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionSpec {
    Inline(CommandOption),
    /// The host's message option, resolved once it is known
    Message { required: bool },
}

/// Arguments passed to a command handler.
#[derive(Debug, Clone, Default)]
pub struct CommandInvocation {
    pub channel_id: String,
    pub args: BTreeMap<String, Value>,
}

impl CommandInvocation {
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }
}

pub type CommandHandler =
    Arc<dyn Fn(&CommandInvocation) -> anyhow::Result<Option<String>> + Send + Sync>;

/// Command declared on a plugin descriptor.
#[derive(Clone)]
pub struct CommandDef {
    pub name: String,
    pub description: String,
    pub options: Vec<OptionSpec>,
    pub execute: CommandHandler,
}

impl CommandDef {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, execute: F) -> Self
    where
        F: Fn(&CommandInvocation) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            options: Vec::new(),
            execute: Arc::new(execute),
        }
    }

    pub fn with_option(mut self, option: OptionSpec) -> Self {
        self.options.push(option);
        self
    }
}

impl fmt::Debug for CommandDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("options", &self.options)
            .finish()
    }
}

/// A command after registration.
#[derive(Debug, Clone)]
pub struct RegisteredCommand {
    pub id: String,
    pub plugin: String,
    pub application_id: String,
    pub def: CommandDef,
}

/// Registry of plugin commands.
pub struct CommandRegistry {
    commands: BTreeMap<String, RegisteredCommand>,
    built_in: HashSet<String>,
    next_id: u64,
    message_option: OnceCell<CommandOption>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
            built_in: HashSet::new(),
            next_id: 1,
            message_option: OnceCell::new(),
        }
    }

    /// Registry aware of the host's own command names.
    pub fn with_built_ins<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        registry.built_in = names.into_iter().map(Into::into).collect();
        registry
    }

    fn generate_id(&mut self) -> String {
        let id = format!("-{}", self.next_id);
        self.next_id += 1;
        id
    }

    /// Registers a command for `plugin` and returns its generated id.
    pub fn register(&mut self, def: CommandDef, plugin: &str) -> Result<String, CommandError> {
        if self.built_in.contains(&def.name) {
            return Err(CommandError::BuiltIn(def.name));
        }
        if self.commands.contains_key(&def.name) {
            return Err(CommandError::Duplicate(def.name));
        }

        let id = self.generate_id();
        debug!(plugin = %plugin, command = %def.name, id = %id, "Registered command");
        self.commands.insert(
            def.name.clone(),
            RegisteredCommand {
                id: id.clone(),
                plugin: plugin.to_string(),
                application_id: PLUGIN_APPLICATION_ID.to_string(),
                def,
            },
        );
        Ok(id)
    }

    pub fn unregister(&mut self, name: &str) -> Result<RegisteredCommand, CommandError> {
        self.commands
            .remove(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))
    }

    /// Removes every command owned by `plugin`. Returns how many were removed.
    pub fn unregister_plugin(&mut self, plugin: &str) -> usize {
        let before = self.commands.len();
        self.commands.retain(|_, c| c.plugin != plugin);
        before - self.commands.len()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredCommand> {
        self.commands.get(name)
    }

    pub fn commands_of<'a>(&'a self, plugin: &'a str) -> impl Iterator<Item = &'a RegisteredCommand> {
        self.commands.values().filter(move |c| c.plugin == plugin)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Supplies the host's message option. Only the first call has an effect.
    pub fn resolve_message_option(&self, option: CommandOption) -> bool {
        self.message_option.set(option).is_ok()
    }

    /// The command's options with deferred message options filled in.
    pub fn resolved_options(&self, name: &str) -> Result<Vec<CommandOption>, CommandError> {
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;

        command
            .def
            .options
            .iter()
            .map(|spec| match spec {
                OptionSpec::Inline(option) => Ok(option.clone()),
                OptionSpec::Message { required } => self
                    .message_option
                    .get()
                    .map(|template| CommandOption {
                        required: *required,
                        ..template.clone()
                    })
                    .ok_or_else(|| CommandError::Unresolved(name.to_string())),
            })
            .collect()
    }

    pub fn execute(&self, name: &str, invocation: &CommandInvocation) -> anyhow::Result<Option<String>> {
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        (command.def.execute)(invocation)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(name: &str) -> CommandDef {
        CommandDef::new(name, "Echo the text back", |inv| {
            Ok(inv.arg_str("text").map(str::to_string))
        })
    }

    #[test]
    fn test_register_assigns_ids() {
        let mut registry = CommandRegistry::new();
        assert_eq!(registry.register(echo("echo"), "Echo").unwrap(), "-1");
        assert_eq!(registry.register(echo("shout"), "Echo").unwrap(), "-2");

        let cmd = registry.get("echo").unwrap();
        assert_eq!(cmd.plugin, "Echo");
        assert_eq!(cmd.application_id, PLUGIN_APPLICATION_ID);
    }

    #[test]
    fn test_duplicate_and_built_in_rejected() {
        let mut registry = CommandRegistry::with_built_ins(["shrug"]);
        registry.register(echo("echo"), "A").unwrap();

        assert_eq!(
            registry.register(echo("echo"), "B"),
            Err(CommandError::Duplicate("echo".to_string()))
        );
        assert_eq!(
            registry.register(echo("shrug"), "B"),
            Err(CommandError::BuiltIn("shrug".to_string()))
        );
    }

    #[test]
    fn test_unregister_plugin() {
        let mut registry = CommandRegistry::new();
        registry.register(echo("a"), "P").unwrap();
        registry.register(echo("b"), "P").unwrap();
        registry.register(echo("c"), "Q").unwrap();

        assert_eq!(registry.unregister_plugin("P"), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.commands_of("Q").count(), 1);
        assert!(registry.unregister("a").is_err());
    }

    #[test]
    fn test_message_option_deferred() {
        let mut registry = CommandRegistry::new();
        registry
            .register(echo("quote").with_option(OptionSpec::Message { required: true }), "Q")
            .unwrap();

        assert_eq!(
            registry.resolved_options("quote"),
            Err(CommandError::Unresolved("quote".to_string()))
        );

        let message = CommandOption::new("message", "Message text", CommandOptionType::String);
        assert!(registry.resolve_message_option(message.clone()));
        assert!(!registry.resolve_message_option(message));

        let options = registry.resolved_options("quote").unwrap();
        assert_eq!(options.len(), 1);
        assert!(options[0].required);
        assert_eq!(options[0].name, "message");
    }

    #[test]
    fn test_execute() {
        let mut registry = CommandRegistry::new();
        registry.register(echo("echo"), "Echo").unwrap();

        let mut inv = CommandInvocation::default();
        inv.args.insert("text".to_string(), Value::from("hi"));
        assert_eq!(registry.execute("echo", &inv).unwrap(), Some("hi".to_string()));
        assert!(registry.execute("missing", &inv).is_err());
    }
}
