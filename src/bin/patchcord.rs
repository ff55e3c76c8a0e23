use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patchcord_core::config::EngineConfig;
use patchcord_core::helper::preview;
use patchcord_core::patcher::PatchEngine;
use patchcord_core::schema::parse_rules_json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "patchcord", about = "Run patch rules against module sources")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply rule definitions to module files and print the load report
    Apply {
        /// JSON rule definitions
        #[arg(long)]
        rules: PathBuf,

        /// Write patched modules to this directory
        #[arg(long)]
        out: Option<PathBuf>,

        /// Module source files; the file stem is the module id
        #[arg(required = true)]
        modules: Vec<PathBuf>,
    },
    /// Try one match/replace against a module file
    Test {
        #[arg(long = "match")]
        pattern: String,

        #[arg(long)]
        replace: String,

        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Apply { rules, out, modules } => apply(config, &rules, out.as_deref(), &modules),
        Commands::Test {
            pattern,
            replace,
            file,
        } => run_test(&pattern, &replace, &file),
    }
}

fn apply(config: EngineConfig, rules: &Path, out: Option<&Path>, modules: &[PathBuf]) -> Result<()> {
    let json = fs::read_to_string(rules).context(format!("Failed to read rules: {:?}", rules))?;
    let mut engine = PatchEngine::new(config);
    for (plugin, rule) in parse_rules_json(&json)? {
        engine.add_patch(&plugin, rule);
    }
    info!(rules = engine.rule_count(), modules = modules.len(), "Applying patches");

    if let Some(dir) = out {
        fs::create_dir_all(dir).context(format!("Failed to create output directory: {:?}", dir))?;
    }

    for path in modules {
        let source = fs::read_to_string(path).context(format!("Failed to read module: {:?}", path))?;
        let module_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("Invalid module file name")?;
        let patched = engine.intercept(&module_id, &source);

        if let (Some(dir), Some(name)) = (out, path.file_name()) {
            let dest = dir.join(name);
            fs::write(&dest, patched).context(format!("Failed to write {:?}", dest))?;
        }
    }

    let report = engine.finish_load();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        anyhow::bail!(
            "{} unmatched rule(s), {} failed replacement(s)",
            report.failures.len(),
            report.errors.len()
        );
    }
    Ok(())
}

fn run_test(pattern: &str, replace: &str, file: &Path) -> Result<()> {
    let source = fs::read_to_string(file).context(format!("Failed to read module: {:?}", file))?;
    let preview = preview(&source, pattern, replace)?;
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}
