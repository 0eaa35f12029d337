//! critiq-ai - pipeline command line
//!
//! One invocation runs one stage and produces one run directory, except
//! `runs`, which only reads the registry.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use critiq_ai::sampler::{BucketKey, SampleTargets, Split};
use critiq_ai::service::{GenerationService, HttpGenerationService, ScriptedService};
use critiq_ai::stages::{self, StageContext, StageReport};
use critiq_common::config::{load_toml_config, resolve_api_key, resolve_root_folder, CritiqConfig, ROOT_FOLDER_ENV};
use critiq_common::db::Registry;
use critiq_common::Stage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "critiq-ai")]
#[command(about = "Classify, benchmark, cluster and normalize course criticisms")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "CRITIQ_CONFIG")]
    config: PathBuf,

    /// Root folder holding runs/ and registry.db
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Serve responses from a recorded calls.jsonl instead of the network
    #[arg(long)]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Draw stratified benchmark splits from a corpus
    Sample(SampleCmd),
    /// Classify a benchmark split or a whole corpus
    Classify(ClassifyCmd),
    /// Compare two benchmark runs on the same split
    Gate(GateCmd),
    /// Cluster accepted predictions within each context
    ClusterContext(ClusterCmd),
    /// Map context clusters onto the taxonomy
    NormalizeGlobal(NormalizeCmd),
    /// Inspect registered runs
    Runs {
        #[command(subcommand)]
        command: RunsCmd,
    },
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("targets").required(true).args(["total", "bucket"])))]
struct SampleCmd {
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long)]
    seed: u64,
    /// Total general-pool sample size, allocated across buckets
    #[arg(long)]
    total: Option<usize>,
    /// Per-bucket target as context/bucket=count (repeatable)
    #[arg(long, value_parser = parse_bucket_target)]
    bucket: Vec<(BucketKey, usize)>,
    /// Include every item of this context in addition to the sample
    #[arg(long)]
    focus_context: Option<String>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("mode").required(true).args(["benchmark", "full_corpus"])))]
struct ClassifyCmd {
    #[arg(long)]
    benchmark: bool,
    #[arg(long)]
    full_corpus: bool,
    /// Benchmark: sample run id or directory
    #[arg(long)]
    sample_run: Option<String>,
    /// Benchmark: split to classify
    #[arg(long, value_parser = parse_split)]
    split: Option<Split>,
    /// Benchmark: gold labels (JSONL)
    #[arg(long)]
    gold: Option<PathBuf>,
    /// Full corpus: items (JSONL)
    #[arg(long)]
    corpus: Option<PathBuf>,
    /// Full corpus: require the configuration accepted by this gate run
    #[arg(long)]
    gate_run: Option<String>,
}

#[derive(Args, Debug)]
struct GateCmd {
    #[arg(long)]
    old_run: String,
    #[arg(long)]
    new_run: String,
    #[arg(long, value_parser = parse_split)]
    split: Split,
    #[arg(long)]
    alpha: Option<f64>,
}

#[derive(Args, Debug)]
struct ClusterCmd {
    /// Classify run id or directory
    #[arg(long)]
    classify_run: String,
}

#[derive(Args, Debug)]
struct NormalizeCmd {
    /// Cluster run id or directory
    #[arg(long)]
    cluster_run: String,
    #[arg(long)]
    taxonomy: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum RunsCmd {
    /// Print a run manifest
    Show { locator: String },
    /// Re-hash a run's outputs against its manifest
    Verify { locator: String },
    /// List registered runs
    List {
        #[arg(long)]
        stage: Option<String>,
    },
}

fn parse_split(s: &str) -> Result<Split, String> {
    Split::parse(s).ok_or_else(|| format!("unknown split '{}' (expected A or B)", s))
}

fn parse_bucket_target(s: &str) -> Result<(BucketKey, usize), String> {
    let (key, count) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected context/bucket=count, got '{}'", s))?;
    let key = BucketKey::parse(key).ok_or_else(|| format!("expected context/bucket, got '{}'", key))?;
    let count = count
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("bad count in '{}': {}", s, e))?;
    Ok((key, count))
}

fn init_tracing(config: &CritiqConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_service(config: &CritiqConfig, replay: Option<&PathBuf>) -> Result<Arc<dyn GenerationService>> {
    if let Some(path) = replay {
        info!("Replaying responses from {}", path.display());
        return Ok(Arc::new(ScriptedService::replay(path)?));
    }
    let service = HttpGenerationService::new(&config.service, resolve_api_key(&config.service))
        .context("Failed to build generation service client")?;
    Ok(Arc::new(service))
}

fn print_report(report: &StageReport) {
    info!(run_dir = %report.run_dir.display(), "Run written");
    println!("{}", report.manifest.run_id);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_toml_config(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    init_tracing(&config);
    info!("Starting critiq-ai {}", stages::code_version());

    let root = resolve_root_folder(cli.root.as_deref(), ROOT_FOLDER_ENV, &config)?;
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create root folder {}", root.display()))?;
    info!("Root folder: {}", root.display());
    let registry = Registry::open(&root).await.context("Failed to open run registry")?;

    let command = match cli.command {
        Command::Runs { command } => return run_registry_command(&registry, command).await,
        other => other,
    };

    let service = build_service(&config, cli.replay.as_ref())?;
    let ctx = StageContext::new(config, root, registry, service);

    let report = match command {
        Command::Sample(cmd) => {
            let targets = match cmd.total {
                Some(total) => SampleTargets::Total(total),
                None => SampleTargets::PerBucket(cmd.bucket.into_iter().collect::<BTreeMap<_, _>>()),
            };
            let args = stages::SampleArgs {
                corpus: cmd.corpus,
                seed: cmd.seed,
                targets,
                focus_context: cmd.focus_context,
            };
            stages::run_sample(&ctx, &args).await?
        }
        Command::Classify(cmd) if cmd.benchmark => {
            let (Some(sample_run), Some(split), Some(gold)) = (cmd.sample_run, cmd.split, cmd.gold) else {
                bail!("--benchmark requires --sample-run, --split and --gold");
            };
            let args = stages::BenchmarkArgs { sample_run, split, gold };
            stages::run_classify_benchmark(&ctx, &args).await?
        }
        Command::Classify(cmd) => {
            let Some(corpus) = cmd.corpus else {
                bail!("--full-corpus requires --corpus");
            };
            let args = stages::FullCorpusArgs {
                corpus,
                gate_run: cmd.gate_run,
            };
            stages::run_classify_full_corpus(&ctx, &args).await?
        }
        Command::Gate(cmd) => {
            let args = stages::GateArgs {
                old_run: cmd.old_run,
                new_run: cmd.new_run,
                split: cmd.split,
                alpha: cmd.alpha,
            };
            stages::run_gate(&ctx, &args).await?
        }
        Command::ClusterContext(cmd) => {
            let args = stages::ClusterArgs {
                classify_run: cmd.classify_run,
            };
            stages::run_cluster_context(&ctx, &args).await?
        }
        Command::NormalizeGlobal(cmd) => {
            let args = stages::NormalizeArgs {
                cluster_run: cmd.cluster_run,
                taxonomy: cmd.taxonomy,
            };
            stages::run_normalize_global(&ctx, &args).await?
        }
        Command::Runs { .. } => bail!("runs does not start a stage"),
    };

    print_report(&report);
    Ok(())
}

async fn run_registry_command(registry: &Registry, command: RunsCmd) -> Result<()> {
    match command {
        RunsCmd::Show { locator } => {
            let manifest = stages::show_run(registry, &locator).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        RunsCmd::Verify { locator } => {
            let report = stages::verify_run(registry, &locator).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                bail!("Run {} failed verification", report.run_id);
            }
        }
        RunsCmd::List { stage } => {
            let stage = match stage {
                Some(s) => Some(Stage::parse(&s).with_context(|| format!("Unknown stage '{}'", s))?),
                None => None,
            };
            for entry in stages::list_runs(registry, stage).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }
    Ok(())
}
