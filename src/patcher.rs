//! Patch engine.
//!
//! [`PatchEngine::intercept`] runs every registered rule over a module's
//! source before the module is first evaluated. Rules apply in registration
//! order (plugin, then rule, then replacement), each on the output of the
//! previous one. Every replacement attempt leaves a [`PatchRecord`];
//! [`PatchEngine::finish_load`] turns them into a [`LoadReport`] once the
//! host finished defining modules.

use crate::config::EngineConfig;
use crate::patches::{plugin_path, PatchRule};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Result of one replacement attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    /// The replacement left the source unchanged
    NoEffect,
    /// The replace callback failed; the rule was rolled back for this module
    Errored { message: String },
    /// A grouped rule was undone because one of its replacements failed
    GroupReverted,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchRecord {
    pub module_id: String,
    pub plugin: String,
    pub rule_index: usize,
    pub replacement_index: Option<usize>,
    pub outcome: PatchOutcome,
    pub timestamp: DateTime<Utc>,
}

/// A rule whose `find` matched no module during the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchMatchFailure {
    pub plugin: String,
    pub rule_index: usize,
    pub find: String,
}

/// A replace callback that failed on some module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchApplyFailure {
    pub plugin: String,
    pub module_id: String,
    pub rule_index: usize,
    pub replacement_index: usize,
    pub message: String,
}

/// A rule whose `find` matched more than one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousFind {
    pub plugin: String,
    pub rule_index: usize,
    pub find: String,
    pub modules: Vec<String>,
}

/// A module changed by at least one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchedModule {
    pub module_id: String,
    pub plugins: Vec<String>,
    pub original_md5: String,
    pub patched_md5: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub modules_seen: usize,
    pub failures: Vec<PatchMatchFailure>,
    pub errors: Vec<PatchApplyFailure>,
    pub ambiguous: Vec<AmbiguousFind>,
    pub patched: Vec<PatchedModule>,
    pub no_effect: usize,
}

impl LoadReport {
    pub fn failures_of<'a>(&'a self, plugin: &'a str) -> impl Iterator<Item = &'a PatchMatchFailure> {
        self.failures.iter().filter(move |f| f.plugin == plugin)
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty()
    }
}

struct RegisteredRule {
    plugin: String,
    rule_index: usize,
    self_path: String,
    rule: PatchRule,
    matched_modules: Vec<String>,
}

pub struct PatchEngine {
    config: EngineConfig,
    rules: Vec<RegisteredRule>,
    records: Vec<PatchRecord>,
    patched: BTreeMap<String, PatchedModule>,
    modules_seen: usize,
}

impl PatchEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            rules: Vec::new(),
            records: Vec::new(),
            patched: BTreeMap::new(),
            modules_seen: 0,
        }
    }

    /// Registers a rule for `plugin` and returns its index among that
    /// plugin's rules.
    pub fn add_patch(&mut self, plugin: &str, rule: PatchRule) -> usize {
        let rule_index = self.rules.iter().filter(|r| r.plugin == plugin).count();
        debug!(plugin = %plugin, rule = rule_index, find = %rule.find, "Registered patch");
        self.rules.push(RegisteredRule {
            plugin: plugin.to_string(),
            rule_index,
            self_path: plugin_path(&self.config.plugin_root, plugin),
            rule,
            matched_modules: Vec::new(),
        });
        rule_index
    }

    /// Withdraws every rule of `plugin`. Modules intercepted earlier keep
    /// their patched source.
    pub fn remove_plugin_patches(&mut self, plugin: &str) -> usize {
        let before = self.rules.len();
        self.rules.retain(|r| r.plugin != plugin);
        let removed = before - self.rules.len();
        if removed > 0 && self.modules_seen > 0 {
            warn!(plugin = %plugin, removed, "Removed patches after modules were already patched");
        }
        removed
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    pub fn patched_module(&self, module_id: &str) -> Option<&PatchedModule> {
        self.patched.get(module_id)
    }

    /// Applies every rule to `source` and returns the rewritten module source.
    pub fn intercept(&mut self, module_id: &str, source: &str) -> String {
        self.modules_seen += 1;
        let reporter = self.config.reporter_mode;
        let mut code = if self.config.normalize_newlines {
            source.replace('\n', "")
        } else {
            source.to_string()
        };
        let mut patched_by: Vec<String> = Vec::new();

        for entry in &mut self.rules {
            if !entry.rule.find.is_found_in(&code) {
                continue;
            }
            entry.matched_modules.push(module_id.to_string());

            if !reporter && !entry.rule.is_active() {
                continue;
            }

            let before_rule = code.clone();
            let group = entry.rule.group && !reporter;
            let mut reverted = false;

            for (replacement_index, replacement) in entry.rule.replacements.iter().enumerate() {
                if !reporter && !replacement.is_active() {
                    continue;
                }

                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    replacement.apply(&code, entry.rule.all, &entry.self_path)
                }))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("replace callback panicked")));

                let record = |outcome| PatchRecord {
                    module_id: module_id.to_string(),
                    plugin: entry.plugin.clone(),
                    rule_index: entry.rule_index,
                    replacement_index: Some(replacement_index),
                    outcome,
                    timestamp: Utc::now(),
                };

                match result {
                    Ok(next) if next == code => {
                        self.records.push(record(PatchOutcome::NoEffect));
                        if !entry.rule.no_warn {
                            warn!(
                                plugin = %entry.plugin,
                                module = %module_id,
                                rule = entry.rule_index,
                                replacement = replacement_index,
                                "Patch had no effect: {}",
                                replacement.matcher
                            );
                            if self.config.dev_mode {
                                debug!(module = %module_id, source = %code, "Module source");
                            }
                        }
                        if group {
                            reverted = true;
                            break;
                        }
                    }
                    Ok(next) => {
                        self.records.push(record(PatchOutcome::Applied));
                        code = next;
                    }
                    Err(e) => {
                        let message = format!("{:#}", e);
                        error!(
                            plugin = %entry.plugin,
                            module = %module_id,
                            rule = entry.rule_index,
                            replacement = replacement_index,
                            error = %message,
                            "Patch failed"
                        );
                        self.records.push(record(PatchOutcome::Errored { message }));
                        code = before_rule.clone();
                        break;
                    }
                }
            }

            if reverted {
                warn!(plugin = %entry.plugin, module = %module_id, rule = entry.rule_index, "Undoing grouped patch");
                self.records.push(PatchRecord {
                    module_id: module_id.to_string(),
                    plugin: entry.plugin.clone(),
                    rule_index: entry.rule_index,
                    replacement_index: None,
                    outcome: PatchOutcome::GroupReverted,
                    timestamp: Utc::now(),
                });
                code = before_rule;
            } else if code != before_rule && !patched_by.contains(&entry.plugin) {
                patched_by.push(entry.plugin.clone());
            }
        }

        if !patched_by.is_empty() {
            debug!(module = %module_id, plugins = ?patched_by, "Patched module");
            self.patched.insert(
                module_id.to_string(),
                PatchedModule {
                    module_id: module_id.to_string(),
                    plugins: patched_by,
                    original_md5: format!("{:x}", md5::compute(source.as_bytes())),
                    patched_md5: format!("{:x}", md5::compute(code.as_bytes())),
                },
            );
        }
        code
    }

    /// Summarizes the load. Rules whose predicate is currently false are not
    /// reported as unmatched.
    pub fn finish_load(&self) -> LoadReport {
        let reporter = self.config.reporter_mode;
        let mut report = LoadReport {
            modules_seen: self.modules_seen,
            patched: self.patched.values().cloned().collect(),
            ..Default::default()
        };

        for entry in &self.rules {
            match entry.matched_modules.len() {
                0 => {
                    if !reporter && !entry.rule.is_active() {
                        continue;
                    }
                    error!(
                        plugin = %entry.plugin,
                        rule = entry.rule_index,
                        find = %entry.rule.find,
                        "Patch found no module"
                    );
                    report.failures.push(PatchMatchFailure {
                        plugin: entry.plugin.clone(),
                        rule_index: entry.rule_index,
                        find: entry.rule.find.to_string(),
                    });
                }
                1 => {}
                _ => {
                    warn!(
                        plugin = %entry.plugin,
                        rule = entry.rule_index,
                        modules = entry.matched_modules.len(),
                        "Patch find matched more than one module"
                    );
                    report.ambiguous.push(AmbiguousFind {
                        plugin: entry.plugin.clone(),
                        rule_index: entry.rule_index,
                        find: entry.rule.find.to_string(),
                        modules: entry.matched_modules.clone(),
                    });
                }
            }
        }

        for record in &self.records {
            match &record.outcome {
                PatchOutcome::Errored { message } => report.errors.push(PatchApplyFailure {
                    plugin: record.plugin.clone(),
                    module_id: record.module_id.clone(),
                    rule_index: record.rule_index,
                    replacement_index: record.replacement_index.unwrap_or_default(),
                    message: message.clone(),
                }),
                PatchOutcome::NoEffect => report.no_effect += 1,
                _ => {}
            }
        }

        info!(
            modules = report.modules_seen,
            patched = report.patched.len(),
            failures = report.failures.len(),
            errors = report.errors.len(),
            "Module load finished"
        );
        report
    }
}

impl Default for PatchEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
