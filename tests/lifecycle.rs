use parking_lot::Mutex;
use patchcord_core::config::EngineConfig;
use patchcord_core::error::{LifecycleError, SettingsError, StoreError};
use patchcord_core::events::{ListenerVerdict, MessageDraft, MessageListeners};
use patchcord_core::manager::ToggleOutcome;
use patchcord_core::options::{OptionSchema, Validity};
use patchcord_core::patches::{Match, PatchRule};
use patchcord_core::persistence::{JsonFileStore, KeyValueStore, MemoryStore};
use patchcord_core::plugin::{FnHooks, PluginDescriptor, StartAt};
use patchcord_core::settings::Settings;
use patchcord_core::{PluginManager, PluginState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn manager() -> PluginManager {
    PluginManager::with_settings(EngineConfig::default(), Settings::in_memory())
}

#[test]
fn test_dependency_start_failure_gates_dependent() {
    let a_starts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&a_starts);

    let mut manager = manager();
    manager
        .register(PluginDescriptor::new("A", "").depends_on("B").hooks(
            FnHooks::new().on_start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ))
        .unwrap();
    manager
        .register(
            PluginDescriptor::new("B", "")
                .hooks(FnHooks::new().on_start(|| anyhow::bail!("B cannot start"))),
        )
        .unwrap();
    assert!(manager.init().is_empty());

    match manager.enable("A") {
        Err(LifecycleError::DependencyStartFailure { plugin, failed }) => {
            assert_eq!(plugin, "A");
            assert_eq!(failed, vec!["B".to_string()]);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(!manager.is_enabled("A"));
    assert_eq!(manager.state("A"), Some(PluginState::Registered));
    assert_eq!(a_starts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_shared_dependency_failure_gates_every_dependent() {
    let c_starts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&c_starts);

    let mut manager = manager();
    manager
        .register(PluginDescriptor::new("A", "").depends_on("B").depends_on("C"))
        .unwrap();
    manager
        .register(
            PluginDescriptor::new("B", "")
                .hooks(FnHooks::new().on_start(|| anyhow::bail!("B cannot start"))),
        )
        .unwrap();
    manager
        .register(PluginDescriptor::new("C", "").depends_on("B").hooks(
            FnHooks::new().on_start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ))
        .unwrap();
    assert!(manager.init().is_empty());

    match manager.enable("A") {
        Err(LifecycleError::DependencyStartFailure { plugin, failed }) => {
            assert_eq!(plugin, "A");
            assert_eq!(failed, vec!["B".to_string(), "C".to_string()]);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(c_starts.load(Ordering::SeqCst), 0);
    for name in ["A", "B", "C"] {
        assert!(!manager.is_running(name), "{name} running");
        assert!(!manager.is_enabled(name), "{name} enabled");
    }
}

#[test]
fn test_dependency_cycle_does_not_block_other_patches() {
    let mut manager = manager();
    manager
        .register(
            PluginDescriptor::new("A", "")
                .depends_on("B")
                .enabled_by_default()
                .patch(PatchRule::new("a").replace(Match::text("a"), "b")),
        )
        .unwrap();
    manager.register(PluginDescriptor::new("B", "").depends_on("A")).unwrap();
    manager
        .register(
            PluginDescriptor::new("Good", "")
                .required()
                .patch(PatchRule::new("x").replace(Match::text("x"), "y")),
        )
        .unwrap();

    let failures = manager.init();
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        LifecycleError::CircularDependency(path) => assert_eq!(path, "A -> B -> A"),
        other => panic!("unexpected: {other:?}"),
    }

    assert_eq!(manager.intercept("1", "x"), "y");
    assert_eq!(manager.intercept("2", "a"), "a");
}

/// Accepts writes until `locked` is set.
#[derive(Default)]
struct LockableStore {
    inner: MemoryStore,
    locked: AtomicBool,
}

impl LockableStore {
    fn writable(&self) -> Result<(), StoreError> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: "settings.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
            });
        }
        Ok(())
    }
}

impl KeyValueStore for LockableStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.writable()?;
        self.inner.set(key, value)
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.writable()?;
        self.inner.del(key)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys()
    }
}

#[test]
fn test_failed_store_write_leaves_setting_unchanged() {
    let store = Arc::new(LockableStore::default());
    let settings = Settings::load(Arc::clone(&store) as Arc<dyn KeyValueStore>);
    let mut manager = PluginManager::with_settings(EngineConfig::default(), settings.clone());
    manager
        .register(PluginDescriptor::new("P", "").option("name", OptionSchema::string("Name")))
        .unwrap();
    settings.set_option("P", "name", json!("old")).unwrap();

    store.locked.store(true, Ordering::SeqCst);
    match settings.set_option("P", "name", json!("new")) {
        Err(SettingsError::Store(StoreError::Io { .. })) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(settings.get("P", "name"), Some(json!("old")));
    assert_eq!(store.get("plugins.P").unwrap(), Some(json!({"name": "old"})));
}

#[test]
fn test_restart_flag_only_for_patched_plugins() {
    let mut manager = manager();
    manager
        .register(
            PluginDescriptor::new("Patched", "")
                .patch(PatchRule::new("x").replace(Match::text("x"), "y")),
        )
        .unwrap();
    manager.register(PluginDescriptor::new("Hooked", "")).unwrap();
    assert!(manager.init().is_empty());

    assert_eq!(manager.enable("Patched").unwrap(), ToggleOutcome::RestartRequired);
    assert!(manager.settings().is_restart_pending("Patched"));
    assert!(manager.is_enabled("Patched"));
    assert!(!manager.is_running("Patched"));

    assert_eq!(manager.enable("Hooked").unwrap(), ToggleOutcome::Started);
    assert!(!manager.settings().is_restart_pending("Hooked"));
    assert!(manager.is_running("Hooked"));
}

#[test]
fn test_disable_patched_plugin_needs_restart() {
    let mut manager = manager();
    manager
        .register(
            PluginDescriptor::new("Patched", "")
                .enabled_by_default()
                .patch(PatchRule::new("x").replace(Match::text("x"), "y")),
        )
        .unwrap();
    assert!(manager.init().is_empty());
    manager.start_all(StartAt::LoaderReady);
    assert!(manager.is_running("Patched"));

    assert_eq!(manager.toggle("Patched").unwrap(), ToggleOutcome::RestartRequired);
    assert!(!manager.is_enabled("Patched"));
    assert!(manager.settings().is_restart_pending("Patched"));
}

#[test]
fn test_validation_short_circuit() {
    let mut manager = manager();
    manager
        .register(PluginDescriptor::new("P", "").option(
            "opt",
            OptionSchema::string("Option").validate_with(|_, value: &Value| match value.as_str() {
                Some("good") => Validity::Valid,
                _ => Validity::from("too short"),
            }),
        ))
        .unwrap();

    let settings = manager.settings().clone();
    settings.set_option("P", "opt", json!("initial")).unwrap_err();
    assert_eq!(settings.get("P", "opt"), None);

    match settings.set_option("P", "opt", json!("bad")) {
        Err(SettingsError::Validation(message)) => assert_eq!(message, "too short"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(settings.get("P", "opt"), None);

    settings.set_option("P", "opt", json!("good")).unwrap();
    assert_eq!(settings.get("P", "opt"), Some(json!("good")));
}

#[test]
fn test_cross_field_validation_sees_plugin_settings() {
    let mut manager = manager();
    manager
        .register(
            PluginDescriptor::new("Range", "")
                .option("min", OptionSchema::number("Min").with_default(0))
                .option(
                    "max",
                    OptionSchema::number("Max").validate_with(|view, value: &Value| {
                        if value.as_f64() >= view.get_f64("min") {
                            Validity::Valid
                        } else {
                            Validity::from("max must not be below min")
                        }
                    }),
                ),
        )
        .unwrap();

    let settings = manager.settings();
    settings.set_option("Range", "min", json!(10)).unwrap();
    assert!(settings.set_option("Range", "max", json!(5)).is_err());
    assert!(settings.set_option("Range", "max", json!(20)).is_ok());
}

#[test]
fn test_legacy_list_migration_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let store = JsonFileStore::open(&path).unwrap();
    store
        .set("plugins.Words", json!({"enabled": true, "blocked": "foo, bar"}))
        .unwrap();
    drop(store);

    let config = EngineConfig {
        settings_path: Some(path.clone()),
        ..Default::default()
    };
    let mut manager = PluginManager::new(config).unwrap();
    manager
        .register(PluginDescriptor::new("Words", "").option(
            "blocked",
            OptionSchema::array("Blocked words")
                .separator(patchcord_core::Separator::Pattern(regex::Regex::new(r",\s*").unwrap())),
        ))
        .unwrap();

    let words = manager.settings().get_array("Words", "blocked").unwrap();
    assert_eq!(words, vec!["foo", "bar"]);

    let reopened = JsonFileStore::open(&path).unwrap();
    let stored = reopened.get("plugins.Words").unwrap().unwrap();
    assert_eq!(stored["blocked"], json!(["foo", "bar"]));

    let again = manager.settings().get_array("Words", "blocked").unwrap();
    assert_eq!(again, words);
    let unchanged = JsonFileStore::open(&path).unwrap().get("plugins.Words").unwrap().unwrap();
    assert_eq!(unchanged, stored);
}

#[test]
fn test_message_listeners_follow_plugin_state() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listeners = MessageListeners {
        pre_send: Some(Arc::new(move |draft: &mut MessageDraft| -> anyhow::Result<ListenerVerdict> {
            sink.lock().push(draft.content.clone());
            draft.content = draft.content.to_uppercase();
            Ok(ListenerVerdict::Continue)
        })),
        ..Default::default()
    };

    let mut manager = manager();
    manager
        .register(PluginDescriptor::new("Shout", "").listeners(listeners))
        .unwrap();
    assert!(manager.init().is_empty());

    manager.enable("Shout").unwrap();
    let mut draft = MessageDraft::new("1", "hi");
    manager.events().dispatch_pre_send(&mut draft);
    assert_eq!(draft.content, "HI");

    manager.disable("Shout").unwrap();
    let mut draft = MessageDraft::new("1", "quiet");
    manager.events().dispatch_pre_send(&mut draft);
    assert_eq!(draft.content, "quiet");
    assert_eq!(*seen.lock(), vec!["hi".to_string()]);
}

#[test]
fn test_stored_enabled_flag_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        settings_path: Some(dir.path().join("settings.json")),
        ..Default::default()
    };

    {
        let mut manager = PluginManager::new(config.clone()).unwrap();
        manager.register(PluginDescriptor::new("A", "")).unwrap();
        assert!(manager.init().is_empty());
        assert_eq!(manager.enable("A").unwrap(), ToggleOutcome::Started);
    }

    let mut manager = PluginManager::new(config).unwrap();
    manager.register(PluginDescriptor::new("A", "")).unwrap();
    assert!(manager.init().is_empty());
    assert!(manager.is_enabled("A"));
    assert!(manager.start_all(StartAt::LoaderReady).is_empty());
    assert!(manager.is_running("A"));
}
