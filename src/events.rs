//! Message-event registry.
//!
//! Plugins hook outgoing and edited messages (and message clicks) through
//! listeners declared on their descriptor. The lifecycle manager adds them when
//! a plugin starts and removes them when it stops; the host calls the
//! `dispatch_*` functions.

use std::fmt;
use std::sync::Arc;
use tracing::error;

/// A message about to be sent or edited. Listeners may rewrite it in place.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageDraft {
    pub channel_id: String,
    /// Set when the draft is an edit of an existing message
    pub message_id: Option<String>,
    pub content: String,
}

impl MessageDraft {
    pub fn new(channel_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: None,
            content: content.into(),
        }
    }
}

/// A click on a rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageClick {
    pub channel_id: String,
    pub message_id: String,
    pub double_click: bool,
}

/// Whether a send/edit should go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerVerdict {
    Continue,
    Cancel,
}

pub type PreSendListener =
    Arc<dyn Fn(&mut MessageDraft) -> anyhow::Result<ListenerVerdict> + Send + Sync>;
pub type PreEditListener =
    Arc<dyn Fn(&mut MessageDraft) -> anyhow::Result<ListenerVerdict> + Send + Sync>;
pub type ClickListener = Arc<dyn Fn(&MessageClick) -> anyhow::Result<()> + Send + Sync>;

/// The listeners a plugin declares on its descriptor.
#[derive(Clone, Default)]
pub struct MessageListeners {
    pub pre_send: Option<PreSendListener>,
    pub pre_edit: Option<PreEditListener>,
    pub click: Option<ClickListener>,
}

impl MessageListeners {
    pub fn is_empty(&self) -> bool {
        self.pre_send.is_none() && self.pre_edit.is_none() && self.click.is_none()
    }
}

impl fmt::Debug for MessageListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageListeners")
            .field("pre_send", &self.pre_send.is_some())
            .field("pre_edit", &self.pre_edit.is_some())
            .field("click", &self.click.is_some())
            .finish()
    }
}

/// Listeners of all running plugins, keyed by plugin name, in start order.
#[derive(Default)]
pub struct MessageEventRegistry {
    pre_send: Vec<(String, PreSendListener)>,
    pre_edit: Vec<(String, PreEditListener)>,
    click: Vec<(String, ClickListener)>,
}

impl MessageEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every listener a plugin declares.
    pub fn add(&mut self, plugin: &str, listeners: &MessageListeners) {
        if let Some(l) = &listeners.pre_send {
            self.pre_send.push((plugin.to_string(), Arc::clone(l)));
        }
        if let Some(l) = &listeners.pre_edit {
            self.pre_edit.push((plugin.to_string(), Arc::clone(l)));
        }
        if let Some(l) = &listeners.click {
            self.click.push((plugin.to_string(), Arc::clone(l)));
        }
    }

    /// Removes every listener owned by `plugin`.
    pub fn remove(&mut self, plugin: &str) {
        self.pre_send.retain(|(owner, _)| owner != plugin);
        self.pre_edit.retain(|(owner, _)| owner != plugin);
        self.click.retain(|(owner, _)| owner != plugin);
    }

    pub fn listener_count(&self) -> usize {
        self.pre_send.len() + self.pre_edit.len() + self.click.len()
    }

    /// Runs pre-send listeners in order. The first `Cancel` stops the send.
    pub fn dispatch_pre_send(&self, draft: &mut MessageDraft) -> ListenerVerdict {
        run_listeners(&self.pre_send, draft, "pre-send")
    }

    /// Runs pre-edit listeners in order. The first `Cancel` stops the edit.
    pub fn dispatch_pre_edit(&self, draft: &mut MessageDraft) -> ListenerVerdict {
        run_listeners(&self.pre_edit, draft, "pre-edit")
    }

    pub fn dispatch_click(&self, click: &MessageClick) {
        for (plugin, listener) in &self.click {
            if let Err(e) = listener(click) {
                error!(plugin = %plugin, error = %e, "Message click listener failed");
            }
        }
    }
}

fn run_listeners(
    listeners: &[(String, PreSendListener)],
    draft: &mut MessageDraft,
    kind: &str,
) -> ListenerVerdict {
    for (plugin, listener) in listeners {
        match listener(draft) {
            Ok(ListenerVerdict::Cancel) => return ListenerVerdict::Cancel,
            Ok(ListenerVerdict::Continue) => {}
            Err(e) => error!(plugin = %plugin, error = %e, "Message {} listener failed", kind),
        }
    }
    ListenerVerdict::Continue
}
