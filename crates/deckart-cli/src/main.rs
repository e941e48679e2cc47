use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deckart_contracts::config::PipelineConfig;
use deckart_contracts::entities::{load_families, EntityFamily};
use deckart_contracts::runs::summary::RunSummary;
use deckart_engine::selection::RandomTieBreaker;
use deckart_engine::{error_chain_text, AssetProvider, DryrunProvider, OpenAiProvider, Pipeline};
use tracing::{warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "DECKART_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "deckart",
    version,
    about = "Generate, judge and select card illustrations"
)]
struct Cli {
    /// Emit newline-delimited JSON logs.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate art for every card and promote one winner per card.
    Run(RunArgs),
    /// Print planned candidate and batch counts without calling a provider.
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// JSONL card records.
    #[arg(long)]
    cards: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// JSON file merged over the default pipeline config.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Candidates per card; overrides the config.
    #[arg(long)]
    candidates: Option<i64>,
    /// Regenerate even when outputs already exist.
    #[arg(long)]
    no_resume: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    input: InputArgs,
    /// Seed for tie-breaks between equally rated candidates.
    #[arg(long)]
    seed: Option<u64>,
    /// Defaults to openai when an API key is set, dryrun otherwise.
    #[arg(long, value_enum)]
    provider: Option<ProviderChoice>,
    /// Event log path; defaults to `<out>/events.jsonl`.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    input: InputArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderChoice {
    Openai,
    Dryrun,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("deckart error: {}", error_chain_text(&err, 2000));
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.log_json, Level::INFO);
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Plan(args) => run_plan(args),
    }
}

fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json().with_writer(std::io::stderr))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

fn load_inputs(input: &InputArgs) -> Result<(PipelineConfig, Vec<EntityFamily>)> {
    let mut config = match input.config.as_deref() {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(candidates) = input.candidates {
        config.candidates = candidates;
    }
    if input.no_resume {
        config.resume = false;
    }
    let families = load_families(&input.cards)?;
    if families.is_empty() {
        warn!(cards = %input.cards.display(), "no card records found");
    }
    Ok((config, families))
}

fn build_provider(
    choice: Option<ProviderChoice>,
    config: &PipelineConfig,
) -> Result<Arc<dyn AssetProvider>> {
    match (choice, OpenAiProvider::from_env()) {
        (Some(ProviderChoice::Dryrun), _) => Ok(Arc::new(DryrunProvider)),
        (_, Some(openai)) => Ok(Arc::new(
            openai.with_responses_model(config.responses_model.clone()),
        )),
        (Some(ProviderChoice::Openai), None) => {
            bail!("--provider openai needs OPENAI_API_KEY (or OPENAI_API_KEY_BACKUP)")
        }
        (None, None) => {
            warn!("OPENAI_API_KEY is not set; using the dryrun provider");
            Ok(Arc::new(DryrunProvider))
        }
    }
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let (config, families) = load_inputs(&args.input)?;
    let provider = build_provider(args.provider, &config)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.input.out.join("events.jsonl"));

    let mut pipeline = Pipeline::new(config, provider, &args.input.out).with_events(events_path);
    if let Some(seed) = args.seed {
        pipeline = pipeline.with_tie_breaker(Box::new(RandomTieBreaker::seeded(seed)));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let summary = runtime.block_on(pipeline.run(&families))?;
    print_summary(&summary, pipeline.out_dir());
    for warning in pipeline.reporter().warnings() {
        println!("warning: {warning}");
    }
    Ok(0)
}

fn run_plan(args: PlanArgs) -> Result<i32> {
    let (config, families) = load_inputs(&args.input)?;
    let pipeline = Pipeline::new(config, Arc::new(DryrunProvider), &args.input.out);
    let mut total_tasks = 0;
    let mut total_batches = 0;
    for preview in pipeline.preview(&families) {
        println!(
            "{}: {} entities ({} skipped), {} candidates ({} reused), {} batches, {} reference(s)",
            preview.family,
            preview.entities,
            preview.skipped,
            preview.tasks,
            preview.reused,
            preview.batches,
            preview.references
        );
        total_tasks += preview.tasks;
        total_batches += preview.batches;
    }
    println!("total: {total_tasks} candidates in {total_batches} batches");
    Ok(0)
}

fn print_summary(summary: &RunSummary, out_dir: &Path) {
    println!(
        "run {}: {} entities, {} skipped, {} candidates generated, {} scored, {} winners",
        summary.run_id,
        summary.entities_total,
        summary.entities_skipped,
        summary.candidates_generated,
        summary.candidates_scored,
        summary.winners.len()
    );
    if summary.failures.total() > 0 {
        let counts: Vec<String> = summary
            .failures
            .counts
            .iter()
            .map(|(stage, count)| format!("{stage}={count}"))
            .collect();
        println!(
            "failures: {} ({}); affected: {}",
            summary.failures.total(),
            counts.join(", "),
            summary.failures.entities.join(", ")
        );
    }
    println!("summary: {}", out_dir.join(deckart_engine::SUMMARY_FILE).display());
}
