// CLI command handlers
use anyhow::{Context, Result};
use loopfuse_core::config::{AnchorStrategy, ChainPolicy, FusionConfig};
use loopfuse_core::ir::function::Function;
use loopfuse_core::optimizer::driver::{AttemptOutcome, FusionReport, LoopFusionPass};
use loopfuse_core::stats;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Input document: one function or a list of functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionSet {
    Single(Function),
    Many(Vec<Function>),
}

impl FunctionSet {
    pub fn functions_mut(&mut self) -> &mut [Function] {
        match self {
            FunctionSet::Single(func) => std::slice::from_mut(func),
            FunctionSet::Many(funcs) => funcs.as_mut_slice(),
        }
    }

    pub fn functions(&self) -> &[Function] {
        match self {
            FunctionSet::Single(func) => std::slice::from_ref(func),
            FunctionSet::Many(funcs) => funcs.as_slice(),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub policy: Option<ChainPolicy>,
    pub anchor: Option<AnchorStrategy>,
    pub max_chain: Option<usize>,
    pub trace: bool,
}

/// Load the config file (if any) and apply command-line overrides.
pub fn resolve_config(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Result<FusionConfig> {
    let mut config = match config_file {
        Some(path) => FusionConfig::load(path)?,
        None => FusionConfig::default(),
    };
    if let Some(policy) = overrides.policy {
        config.policy = policy;
    }
    if let Some(anchor) = &overrides.anchor {
        config.anchor = anchor.clone();
    }
    if overrides.max_chain.is_some() {
        config.max_chain = overrides.max_chain;
    }
    config.trace |= overrides.trace;
    Ok(config)
}

pub fn load_functions(input: &Path) -> Result<FunctionSet> {
    let content = fs::read_to_string(input)
        .with_context(|| format!("Failed to read input file: {}", input.display()))?;
    let set: FunctionSet = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse functions from {}", input.display()))?;
    for func in set.functions() {
        func.verify()
            .with_context(|| format!("Input function `{}` is malformed", func.name))?;
    }
    Ok(set)
}

pub fn write_json<T: Serialize>(value: &T, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }
    let content = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    fs::write(output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(())
}

pub fn analyze_file(input: &Path, config: &FusionConfig, report_file: Option<&Path>) -> Result<Vec<FusionReport>> {
    println!("Reading functions from: {}", input.display());
    let set = load_functions(input)?;
    let pass = LoopFusionPass::new(config.clone());

    let mut reports = Vec::with_capacity(set.functions().len());
    for func in set.functions() {
        let report = pass
            .analyze(func)
            .with_context(|| format!("Failed to analyze `{}`", func.name))?;
        print_report(&report);
        reports.push(report);
    }

    if let Some(path) = report_file {
        write_json(&reports, path)?;
        println!("Report written to: {}", path.display());
    }
    Ok(reports)
}

pub fn fuse_file(
    input: &Path,
    output: Option<&Path>,
    config: &FusionConfig,
    report_file: Option<&Path>,
) -> Result<Vec<FusionReport>> {
    println!("Reading functions from: {}", input.display());
    let mut set = load_functions(input)?;
    let pass = LoopFusionPass::new(config.clone());
    println!("Policy: {}, anchor: {}", config.policy, config.anchor);

    let mut reports = Vec::with_capacity(set.functions().len());
    for func in set.functions_mut() {
        let report = pass
            .run(func)
            .with_context(|| format!("Failed to run loop fusion on `{}`", func.name))?;
        print_report(&report);
        reports.push(report);
    }

    if let Some(path) = output {
        write_json(&set, path)?;
        println!("Transformed functions written to: {}", path.display());
    }
    if let Some(path) = report_file {
        write_json(&reports, path)?;
        println!("Report written to: {}", path.display());
    }
    Ok(reports)
}

pub fn print_report(report: &FusionReport) {
    println!("\nFunction: {}", report.function);
    println!(
        "  Loops: {} -> {}{}",
        report.loops_before,
        report.loops_after,
        if report.modified { " (modified)" } else { "" }
    );
    for attempt in &report.attempts {
        let outcome = match &attempt.outcome {
            AttemptOutcome::Fused => "fused".to_string(),
            AttemptOutcome::Legal => "legal".to_string(),
            AttemptOutcome::Rejected(reason) => format!("rejected: {}", reason),
            AttemptOutcome::Aborted(message) => format!("aborted: {}", message),
        };
        println!("    {} + {}: {}", attempt.anchor, attempt.candidate, outcome);
    }
    if let Some(trace) = &report.trace {
        println!("  Before:\n{}", trace.before);
        println!("  After:\n{}", trace.after);
    }
}

pub fn print_stats() {
    let stats = stats::snapshot();
    println!("\nStatistics:");
    println!("  Functions analyzed: {}", stats.functions_analyzed);
    println!("  Pairs attempted: {}", stats.pairs_attempted);
    println!("  Pairs fused: {}", stats.pairs_fused);
    println!("  Pairs rejected: {}", stats.pairs_rejected);
}
