//! CLI surface for keyshift.
//!
//! Thin handlers over the library: resolve config, open the store, call into
//! the pipeline, print a human or JSON summary.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand, builder::BoolishValueParser};
use serde_json::json;

use crate::config::{Config, ConfigError, StoreBackend};
use crate::inspect::sweep_scratch;
use crate::load::LoadPolicy;
use crate::pipeline::{
    Pipeline, PipelineOptions, PipelineState, Stage, StageReport, StageStatus, load_manifest,
};
use crate::snapshot::{RunManifest, export_store};
use crate::store::{MemoryStore, SqliteStore, Store};
use crate::transform::PhasePlan;
use crate::Result;

/// Exit code when a stage ran and failed.
pub const EXIT_STAGE_FAILED: u8 = 4;

// =============================================================================
// Entry + global options
// =============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "keyshift",
    version,
    about = "Migrate v1 key-value snapshots to the v2 schema and rebuild indexes",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(
        long,
        global = true,
        default_value_t = false,
        num_args = 0..=1,
        value_parser = BoolishValueParser::new()
    )]
    pub json: bool,

    /// Run config file (default: ./keyshift.toml if present).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// More log output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the whole pipeline, or one stage of it.
    Run(RunArgs),

    /// Dump a live store into per-model snapshot files.
    Export(ExportArgs),

    /// Delete leftover scratch keys from a store.
    Sweep(SweepArgs),

    /// Show the run manifest in an output directory.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run only this stage (its preconditions must hold).
    #[arg(long, value_enum)]
    pub stage: Option<Stage>,

    /// Snapshot directory from `keyshift export`.
    #[arg(long, value_name = "DIR")]
    pub input: Option<PathBuf>,

    /// Directory for transformed files, reports and the manifest.
    #[arg(long, value_name = "DIR")]
    pub output: PathBuf,

    /// What to do with keys that already exist in the target store.
    #[arg(long, value_enum)]
    pub policy: Option<LoadPolicy>,

    /// Compute and report everything without writing to the target store.
    #[arg(long)]
    pub dry_run: bool,

    /// Target sqlite store (overrides config).
    #[arg(long, value_name = "PATH")]
    pub store: Option<PathBuf>,

    /// Errors kept verbatim per stage report.
    #[arg(long, value_name = "N")]
    pub max_errors: Option<usize>,

    /// Objects sampled per model by post-load shape checks.
    #[arg(long, value_name = "N")]
    pub sample_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Source sqlite store.
    #[arg(long, value_name = "PATH")]
    pub source: PathBuf,

    /// Snapshot directory to write.
    #[arg(long, value_name = "DIR")]
    pub output: PathBuf,

    /// Key prefixes to export (default: every source model).
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefixes: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Store to sweep (overrides config).
    #[arg(long, value_name = "PATH")]
    pub store: Option<PathBuf>,

    /// Scratch prefix (overrides config).
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long, value_name = "DIR")]
    pub output: PathBuf,
}

// =============================================================================
// Public API
// =============================================================================

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Run the CLI (used by bin). Returns the process exit code.
pub fn run(cli: Cli, config: Config) -> Result<u8> {
    let ctx = Ctx {
        json: cli.json,
        config,
    };
    match cli.command {
        Commands::Run(args) => handle_run(&ctx, args),
        Commands::Export(args) => handle_export(&ctx, args),
        Commands::Sweep(args) => handle_sweep(&ctx, args),
        Commands::Status(args) => handle_status(&ctx, args),
    }
}

// =============================================================================
// Handlers
// =============================================================================

struct Ctx {
    json: bool,
    config: Config,
}

fn handle_run(ctx: &Ctx, args: RunArgs) -> Result<u8> {
    let store = open_store(&ctx.config, args.store.as_deref())?;
    let mut options = PipelineOptions::new(args.input, args.output);
    options.policy = args.policy.unwrap_or(ctx.config.load.policy);
    options.dry_run = args.dry_run;
    options.scratch_prefix = ctx.config.scratch.prefix.clone();
    options.max_errors = args.max_errors.unwrap_or(ctx.config.manifest.max_errors);
    options.sample_size = args.sample_size.unwrap_or(ctx.config.validate.sample_size);
    let pipeline = Pipeline::new(store.as_ref(), options)?;

    match args.stage {
        Some(stage) => {
            let report = pipeline.run_stage(stage)?;
            if ctx.json {
                print_line(&to_json(&report)?)?;
            } else {
                print_line(&render_stage(&report))?;
            }
            Ok(match report.status {
                StageStatus::Completed => 0,
                StageStatus::Failed => EXIT_STAGE_FAILED,
            })
        }
        None => {
            let summary = pipeline.run_all()?;
            if ctx.json {
                print_line(&to_json(&summary.manifest)?)?;
            } else {
                print_line(&render_manifest(&summary.manifest))?;
                print_line(&match summary.state {
                    PipelineState::Complete => "pipeline complete".to_string(),
                    PipelineState::Failed { stage } => format!("pipeline halted at {stage}"),
                    PipelineState::At(stage) => format!("pipeline stopped before {stage}"),
                })?;
            }
            Ok(if summary.succeeded() {
                0
            } else {
                EXIT_STAGE_FAILED
            })
        }
    }
}

fn handle_export(ctx: &Ctx, args: ExportArgs) -> Result<u8> {
    if !args.source.exists() {
        return Err(ConfigError::NotFound { path: args.source }.into());
    }
    let store = SqliteStore::open(&args.source)?;
    let prefixes: Vec<String> = if args.prefixes.is_empty() {
        PhasePlan::standard()?
            .sources()
            .into_iter()
            .map(str::to_string)
            .collect()
    } else {
        args.prefixes
    };
    let prefixes: Vec<&str> = prefixes.iter().map(String::as_str).collect();
    let report = export_store(&store, &prefixes, &args.output)?;
    if ctx.json {
        print_line(&to_json(&json!({
            "output": args.output,
            "written": report.written,
            "vanished": report.vanished,
            "warnings": report.warnings,
        }))?)?;
    } else {
        for (prefix, lines) in &report.written {
            print_line(&format!("{prefix}: {lines} line(s)"))?;
        }
        for warning in &report.warnings {
            print_line(&format!("warning: {warning}"))?;
        }
        print_line(&format!(
            "exported {} line(s) to {}",
            report.total(),
            args.output.display()
        ))?;
    }
    Ok(0)
}

fn handle_sweep(ctx: &Ctx, args: SweepArgs) -> Result<u8> {
    let store = open_store(&ctx.config, args.store.as_deref())?;
    let prefix = args
        .prefix
        .unwrap_or_else(|| ctx.config.scratch.prefix.clone());
    let removed = sweep_scratch(store.as_ref(), &prefix)?;
    if ctx.json {
        print_line(&to_json(&json!({ "prefix": prefix, "removed": removed }))?)?;
    } else {
        print_line(&format!("removed {removed} scratch key(s) under `{prefix}`"))?;
    }
    Ok(0)
}

fn handle_status(ctx: &Ctx, args: StatusArgs) -> Result<u8> {
    let Some(manifest) = load_manifest(&args.output)? else {
        if ctx.json {
            print_line("null")?;
        } else {
            print_line(&format!("no run recorded in {}", args.output.display()))?;
        }
        return Ok(1);
    };
    if ctx.json {
        print_line(&to_json(&manifest)?)?;
    } else {
        print_line(&render_manifest(&manifest))?;
    }
    Ok(0)
}

// =============================================================================
// Helpers
// =============================================================================

/// `--store` wins; otherwise the configured backend.
fn open_store(config: &Config, store: Option<&Path>) -> Result<Box<dyn Store>> {
    if let Some(path) = store {
        return Ok(Box::new(SqliteStore::open(path)?));
    }
    match config.store.backend {
        StoreBackend::Sqlite => {
            let path = config
                .store
                .path
                .clone()
                .unwrap_or_else(crate::paths::default_store_path);
            Ok(Box::new(SqliteStore::open(&path)?))
        }
        StoreBackend::Memory => {
            tracing::warn!("using an in-memory store; nothing will persist after this run");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

fn render_stage(report: &StageReport) -> String {
    let status = match report.status {
        StageStatus::Completed => "completed",
        StageStatus::Failed => "FAILED",
    };
    let mut out = format!(
        "{:<14} {status:<10} errors={}",
        report.stage.as_str(),
        report.error_count
    );
    if let Some(failure) = &report.failure {
        out.push_str(&format!("\n    {failure}"));
    }
    for entry in report.errors.iter().take(5) {
        out.push_str(&format!(
            "\n    [{}] {}{}",
            entry.class,
            entry.key.as_deref().map(|k| format!("{k}: ")).unwrap_or_default(),
            entry.message
        ));
    }
    out
}

fn render_manifest(manifest: &RunManifest) -> String {
    let mut lines = vec![format!(
        "run {}{}",
        manifest.run_id,
        if manifest.dry_run { " (dry run)" } else { "" }
    )];
    for stage in Stage::ALL {
        match manifest.stage(stage) {
            Some(report) => lines.push(render_stage(report)),
            None => lines.push(format!("{:<14} pending", stage.as_str())),
        }
    }
    lines.join("\n")
}

fn to_json(value: &impl serde::Serialize) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn print_line(s: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{s}")
        && e.kind() != std::io::ErrorKind::BrokenPipe
    {
        return Err(crate::pipeline::PipelineError::Io {
            path: PathBuf::from("<stdout>"),
            source: e,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_parse() {
        let cli = parse_from([
            "keyshift",
            "run",
            "--stage",
            "rebuild_index",
            "--output",
            "out",
            "--policy",
            "skip",
            "--dry-run",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.stage, Some(Stage::RebuildIndex));
        assert_eq!(args.policy, Some(LoadPolicy::Skip));
        assert!(args.dry_run);
        assert!(args.input.is_none());
    }

    #[test]
    fn memory_backend_is_the_default() {
        let store = open_store(&Config::default(), None).expect("store");
        assert!(store.exists("anything").is_ok());
    }

    #[test]
    fn render_lists_pending_stages() {
        let manifest = RunManifest::new(true, None);
        let text = render_manifest(&manifest);
        assert!(text.contains("(dry run)"));
        assert_eq!(text.matches("pending").count(), Stage::ALL.len());
    }
}
