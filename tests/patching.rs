use patchcord_core::config::EngineConfig;
use patchcord_core::patcher::PatchEngine;
use patchcord_core::patches::{Find, Match, PatchRule, Replace};
use patchcord_core::plugin::PluginDescriptor;
use patchcord_core::settings::Settings;
use patchcord_core::PluginManager;

fn rewrite(find: &str, from: &str, to: &str) -> PatchRule {
    PatchRule::new(find).replace(Match::regex(from).unwrap(), to)
}

#[test]
fn test_end_to_end_return_rewrite() {
    let mut manager = PluginManager::with_settings(EngineConfig::default(), Settings::in_memory());
    manager
        .register(
            PluginDescriptor::new("Answer", "Returns 42")
                .required()
                .patch(rewrite("return null", "return null", "return 42")),
        )
        .unwrap();
    manager
        .register(
            PluginDescriptor::new("Unrelated", "Never matches")
                .required()
                .patch(rewrite("nonexistent", "x", "y")),
        )
        .unwrap();
    assert!(manager.init().is_empty());

    assert_eq!(
        manager.intercept("100", "function(e){return null}"),
        "function(e){return 42}"
    );

    let report = manager.finish_load();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures_of("Unrelated").count(), 1);
    assert_eq!(report.failures_of("Answer").count(), 0);
    assert_eq!(report.failures[0].rule_index, 0);
}

#[test]
fn test_rule_order_matters() {
    let mut forward = PatchEngine::default();
    forward.add_patch("P", rewrite("X", "foo", "bar"));
    forward.add_patch("P", rewrite("X", "bar", "baz"));
    assert!(forward.intercept("1", "X(foo)").contains("baz"));

    let mut backward = PatchEngine::default();
    backward.add_patch("P", rewrite("X", "bar", "baz"));
    backward.add_patch("P", rewrite("X", "foo", "bar"));
    let out = backward.intercept("1", "X(foo)");
    assert!(out.contains("bar"));
    assert!(!out.contains("baz"));
}

#[test]
fn test_plugins_apply_in_registration_order() {
    let mut engine = PatchEngine::default();
    engine.add_patch("First", rewrite("a", "a", "b"));
    engine.add_patch("Second", rewrite("b", "b", "c"));
    assert_eq!(engine.intercept("1", "a"), "c");
    assert_eq!(
        engine.patched_module("1").map(|m| m.plugins.clone()),
        Some(vec!["First".to_string(), "Second".to_string()])
    );
}

#[test]
fn test_disabled_plugin_patches_are_not_applied() {
    let mut manager = PluginManager::with_settings(EngineConfig::default(), Settings::in_memory());
    manager
        .register(PluginDescriptor::new("Off", "").patch(rewrite("a", "a", "b")))
        .unwrap();
    assert!(manager.init().is_empty());

    assert_eq!(manager.intercept("1", "a"), "a");
    assert!(manager.finish_load().failures.is_empty());
}

#[test]
fn test_identifier_escape_survives_renames() {
    let rule = PatchRule::new(Find::pattern(r"\i\.isStaff\(\)").unwrap())
        .replace(Match::regex(r"(\i)\.isStaff\(\)").unwrap(), "($1.isStaff()||true)");

    for (id, source) in [("1", "if(e.isStaff())"), ("2", "if(t$1.isStaff())")] {
        let mut engine = PatchEngine::default();
        engine.add_patch("Staff", rule.clone());
        let out = engine.intercept(id, source);
        assert!(out.contains("isStaff()||true"), "{out}");
    }
}

#[test]
fn test_callback_sees_groups_and_self() {
    let mut engine = PatchEngine::default();
    engine.add_patch(
        "Hook",
        PatchRule::new("render").replace(
            Match::regex(r"(\i)\.render\((\i)\)").unwrap(),
            Replace::with(|args| {
                Ok(format!(
                    "$self.wrap({},{})",
                    args.group(1).unwrap_or_default(),
                    args.group(2).unwrap_or_default()
                ))
            }),
        ),
    );

    assert_eq!(
        engine.intercept("1", "n.render(p)"),
        "Patchcord.Plugins.plugins[\"Hook\"].wrap(n,p)"
    );
}

#[test]
fn test_failed_callback_does_not_block_other_plugins() {
    let mut engine = PatchEngine::default();
    engine.add_patch(
        "Broken",
        PatchRule::new("a").replace(Match::text("a"), Replace::with(|_| anyhow::bail!("boom"))),
    );
    engine.add_patch("Fine", rewrite("a", "a", "ok"));

    assert_eq!(engine.intercept("1", "a"), "ok");
    let report = engine.finish_load();
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].plugin, "Broken");
    assert!(report.failures.is_empty());
}
