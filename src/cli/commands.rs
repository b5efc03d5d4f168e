//! CLI command definitions for puzzle-forge.
//!
//! Each model-backed stage is its own subcommand sharing one set of run
//! arguments. `filter` and `status` work on files only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::{self, FailureKind};
use crate::dataset::{filter_correct, Attachment};
use crate::llm::{AnthropicClient, ANTHROPIC_BASE_URL, DEFAULT_MODEL};
use crate::metrics::{init_metrics, write_metrics};
use crate::pipeline::{EngineConfig, ExecutionMode, PipelineRunner};
use crate::stages::{PromptTemplate, StageKind};

/// Resumable LLM batch engine for visual-puzzle data curation.
#[derive(Parser)]
#[command(name = "puzzle-forge")]
#[command(about = "Resumable LLM batch engine for visual-puzzle data curation")]
#[command(version)]
#[command(
    long_about = "puzzle-forge drives every item of a puzzle dataset through a model-backed stage exactly once, checkpointing results so interrupted runs resume where they stopped.\n\nExample usage:\n  puzzle-forge verify --input data/questions.json --output data/verify.json --template prompts/verify.md"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Translate and rewrite puzzle explanations.
    Rewrite(RunArgs),

    /// Answer each puzzle from its image to check the reference answer.
    Verify(RunArgs),

    /// Abstract the rule behind each puzzle, guided by an example image.
    Abstract(AbstractArgs),

    /// Classify each puzzle's rule.
    Classify(RunArgs),

    /// Keep the questions whose verified answer matches the reference answer.
    Filter(FilterArgs),

    /// Summarize an output checkpoint.
    Status(StatusArgs),
}

/// Arguments shared by every model-backed stage.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Input JSON file (array of objects with an `id`).
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output checkpoint file; existing results are resumed.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Prompt template file.
    #[arg(short, long)]
    pub template: PathBuf,

    /// Fallback directory searched for images by file name.
    #[arg(long)]
    pub image_dir: Option<PathBuf>,

    /// Dispatch mode (streaming or batch). Defaults per stage.
    #[arg(long)]
    pub mode: Option<ExecutionMode>,

    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Anthropic API key.
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Anthropic API base URL.
    #[arg(long, env = "ANTHROPIC_API_BASE")]
    pub api_base: Option<String>,

    /// Model override.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Sampling temperature override.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Generation limit override.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Number of streaming workers.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Items per provider batch job.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Seconds to pause before each remote call.
    #[arg(long)]
    pub request_delay: Option<f64>,

    /// Upper bound in seconds of the random extra pause.
    #[arg(long)]
    pub request_jitter: Option<f64>,

    /// Completions between checkpoint saves (streaming mode).
    #[arg(long)]
    pub save_interval: Option<usize>,

    /// Batch jobs between checkpoint saves (batch mode).
    #[arg(long)]
    pub batch_save_every: Option<usize>,

    /// Seconds between batch status polls.
    #[arg(long)]
    pub poll_interval: Option<f64>,

    /// Maximum attempts per remote call while rate limited.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Re-attempt items whose recorded result is a failure.
    #[arg(long)]
    pub retry_failed: bool,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

/// Arguments for the `abstract` stage.
#[derive(clap::Args, Debug, Clone)]
pub struct AbstractArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Example image inserted at the template's example marker.
    #[arg(long)]
    pub example_image: PathBuf,
}

/// Arguments for the `filter` command.
#[derive(clap::Args, Debug, Clone)]
pub struct FilterArgs {
    /// Verification results (output of `verify`).
    #[arg(short, long)]
    pub results: PathBuf,

    /// Question file the results were produced from.
    #[arg(short, long)]
    pub questions: PathBuf,

    /// Output directory for the filtered questions and images.
    #[arg(short, long)]
    pub output_dir: PathBuf,

    /// Rewrite image paths without copying the image files.
    #[arg(long)]
    pub skip_images: bool,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `status` command.
#[derive(clap::Args, Debug, Clone)]
pub struct StatusArgs {
    /// Checkpoint file to inspect.
    pub checkpoint: PathBuf,

    /// Print the counts as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Rewrite(args) => run_stage_command(StageKind::Rewrite, args, None).await,
        Commands::Verify(args) => run_stage_command(StageKind::Verify, args, None).await,
        Commands::Abstract(args) => {
            run_stage_command(StageKind::Abstract, args.run, Some(args.example_image)).await
        }
        Commands::Classify(args) => run_stage_command(StageKind::Classify, args, None).await,
        Commands::Filter(args) => run_filter_command(args),
        Commands::Status(args) => run_status_command(args),
    }
}

// ============================================================================
// Stage commands
// ============================================================================

/// Layers the YAML file, the environment and the flags over the defaults.
fn build_config(args: &RunArgs) -> anyhow::Result<EngineConfig> {
    let base = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let mut config = base
        .apply_env()
        .context("Invalid PUZZLE_FORGE_* environment variable")?;

    if let Some(mode) = args.mode {
        config = config.with_mode(mode);
    }
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if let Some(size) = args.batch_size {
        config = config.with_batch_size(size);
    }
    if args.request_delay.is_some() || args.request_jitter.is_some() {
        let delay = secs_arg(args.request_delay, config.request_delay, "--request-delay")?;
        let jitter = secs_arg(args.request_jitter, config.request_jitter, "--request-jitter")?;
        config = config.with_pacing(delay, jitter);
    }
    if let Some(interval) = args.save_interval {
        config = config.with_save_interval(interval);
    }
    if let Some(chunks) = args.batch_save_every {
        config = config.with_batch_save_every(chunks);
    }
    if args.poll_interval.is_some() {
        let interval = secs_arg(args.poll_interval, config.poll_interval, "--poll-interval")?;
        config = config.with_poll_interval(interval);
    }
    if let Some(attempts) = args.max_retries {
        let retry = config.retry.clone().with_max_attempts(attempts);
        config = config.with_retry(retry);
    }
    if args.retry_failed {
        config = config.with_retry_failed(true);
    }
    if let Some(model) = &args.model {
        config = config.with_model(model.clone());
    }
    if let Some(temperature) = args.temperature {
        config = config.with_temperature(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        config = config.with_max_tokens(max_tokens);
    }

    config.validate()?;
    Ok(config)
}

fn secs_arg(value: Option<f64>, fallback: Duration, flag: &str) -> anyhow::Result<Duration> {
    match value {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", flag, e)),
        None => Ok(fallback),
    }
}

fn build_client(args: &RunArgs) -> anyhow::Result<Arc<AnthropicClient>> {
    let api_key = args.api_key.clone().unwrap_or_default();
    let base_url = args
        .api_base
        .clone()
        .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string());
    let client = AnthropicClient::with_custom_url(api_key, base_url, DEFAULT_MODEL).map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize Anthropic client: {}. Please provide --api-key or set ANTHROPIC_API_KEY.",
            e
        )
    })?;
    Ok(Arc::new(client))
}

async fn run_stage_command(
    kind: StageKind,
    args: RunArgs,
    example_image: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let mode = config.mode_or(kind.default_mode());

    let template = PromptTemplate::from_file(&args.template)
        .with_context(|| format!("Failed to load template {}", args.template.display()))?;
    let example = match &example_image {
        Some(path) => Some(
            Attachment::from_path(path)
                .with_context(|| format!("Failed to load example image {}", path.display()))?,
        ),
        None => None,
    };
    let stage = kind
        .build(template, example, &config)
        .with_context(|| format!("Invalid template for the {} stage", kind))?;
    let client = build_client(&args)?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    info!(
        stage = %kind,
        mode = %mode,
        model = stage.model(),
        api_key = %client.api_key_masked(),
        input = %args.input.display(),
        output = %args.output.display(),
        "Starting run"
    );

    let runner = PipelineRunner::new(Arc::new(stage), config)
        .with_mode(mode)
        .with_provider(client.clone())
        .with_batch_provider(client);
    let summary = runner
        .run(&args.input, &args.output, args.image_dir.as_deref())
        .await
        .with_context(|| format!("The {} run failed", kind))?;

    summary.log();
    if args.json {
        let json_output = summary
            .to_json()
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    }

    if let Some(path) = &args.metrics_out {
        write_metrics(path)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics written");
    }

    Ok(())
}

// ============================================================================
// File commands
// ============================================================================

#[derive(Debug, Serialize)]
struct FilterOutput {
    source_questions: usize,
    correct: usize,
    written: usize,
    images_copied: usize,
    images_missing: usize,
    output_file: String,
}

fn run_filter_command(args: FilterArgs) -> anyhow::Result<()> {
    let report = filter_correct(
        &args.results,
        &args.questions,
        &args.output_dir,
        !args.skip_images,
    )
    .context("Filtering verified results failed")?;

    if args.json {
        let output = FilterOutput {
            source_questions: report.source_questions,
            correct: report.correct,
            written: report.written,
            images_copied: report.images_copied,
            images_missing: report.images_missing,
            output_file: report.output_file.display().to_string(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Kept {} of {} questions ({} images copied, {} missing) -> {}",
            report.written,
            report.source_questions,
            report.images_copied,
            report.images_missing,
            report.output_file.display()
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    checkpoint: String,
    records: usize,
    successes: usize,
    failures: usize,
    failures_by_kind: Vec<(FailureKind, usize)>,
}

fn status_output(path: &Path) -> anyhow::Result<StatusOutput> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "Checkpoint file does not exist: {}",
            path.display()
        ));
    }
    let set = checkpoint::load(path);
    Ok(StatusOutput {
        checkpoint: path.display().to_string(),
        records: set.len(),
        successes: set.success_count(),
        failures: set.failure_count(),
        failures_by_kind: set.failures_by_kind().into_iter().collect(),
    })
}

fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let status = status_output(&args.checkpoint)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Checkpoint: {}", status.checkpoint);
    println!("  records:   {}", status.records);
    println!("  successes: {}", status.successes);
    println!("  failures:  {}", status.failures);
    for (kind, count) in &status.failures_by_kind {
        println!("    {:<20} {}", kind.as_str(), count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify_args() {
        let cli = Cli::try_parse_from([
            "puzzle-forge",
            "verify",
            "--input",
            "in.json",
            "--output",
            "out.json",
            "--template",
            "verify.md",
            "--mode",
            "batch",
            "-j",
            "3",
            "--retry-failed",
            "--api-key",
            "sk-test",
        ])
        .expect("parse");

        let Commands::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert_eq!(args.mode, Some(ExecutionMode::Batch));
        assert_eq!(args.concurrency, Some(3));
        assert!(args.retry_failed);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_abstract_requires_example_image() {
        let result = Cli::try_parse_from([
            "puzzle-forge",
            "abstract",
            "-i",
            "in.json",
            "-o",
            "out.json",
            "-t",
            "abstract.md",
        ]);
        assert!(result.is_err());
    }

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec![
            "puzzle-forge",
            "rewrite",
            "-i",
            "in.json",
            "-o",
            "out.json",
            "-t",
            "rewrite.md",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("parse").command {
            Commands::Rewrite(args) => args,
            _ => panic!("expected rewrite"),
        }
    }

    #[test]
    fn test_build_config_applies_flags() {
        let args = run_args(&[
            "--batch-size",
            "7",
            "--request-delay",
            "0",
            "--max-retries",
            "2",
            "--temperature",
            "0.3",
        ]);
        let config = build_config(&args).expect("config");
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.request_delay, Duration::ZERO);
        assert_eq!(config.request_jitter, EngineConfig::default().request_jitter);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.temperature, Some(0.3));
    }

    #[test]
    fn test_build_config_rejects_invalid_flags() {
        let args = run_args(&["--save-interval", "0"]);
        assert!(build_config(&args).is_err());

        let args = run_args(&["--poll-interval=-1"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_build_config_reads_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "concurrency: 9\nmode: batch\n").expect("write");
        let args = run_args(&["--config", path.to_str().expect("utf8")]);
        let config = build_config(&args).expect("config");
        assert_eq!(config.concurrency, 9);
        assert_eq!(config.mode, Some(ExecutionMode::Batch));
    }

    #[test]
    fn test_status_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        std::fs::write(
            &path,
            r#"[{"id": 1, "answer": "A"}, {"id": 2, "error": "boom", "error_kind": "remote_fatal"}]"#,
        )
        .expect("write");

        let status = status_output(&path).expect("status");
        assert_eq!(status.records, 2);
        assert_eq!(status.successes, 1);
        assert_eq!(status.failures, 1);
        assert_eq!(status.failures_by_kind, vec![(FailureKind::RemoteFatal, 1)]);

        assert!(status_output(&dir.path().join("missing.json")).is_err());
    }
}
