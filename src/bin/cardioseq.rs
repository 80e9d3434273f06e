use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use cardioseq::aggregate;
use cardioseq::checkpoint::CheckpointStore;
use cardioseq::config::{ConfigLoader, ResolvedConfig, load_backlog};
use cardioseq::context::RunContext;
use cardioseq::domain::RunAccession;
use cardioseq::error::PipelineError;
use cardioseq::metadata::{HttpEutilsClient, MetadataFetcher};
use cardioseq::monitor;
use cardioseq::output::JsonOutput;
use cardioseq::quota::DiskQuotaGuard;
use cardioseq::scheduler::BatchScheduler;
use cardioseq::sra::SystemSraToolchain;
use cardioseq::store::RunLayout;

#[derive(Parser)]
#[command(name = "cardioseq")]
#[command(about = "Resumable, disk-bounded batch download + QC pipeline for SRA cohorts")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Process a sample backlog from scratch")]
    Run(RunArgs),
    #[command(about = "Resume an interrupted run from the checkpoint")]
    Resume(RunArgs),
    #[command(about = "Fetch remote metadata for a list of accessions")]
    FetchMetadata(FetchMetadataArgs),
    #[command(about = "Show pipeline or metadata progress")]
    Status(StatusArgs),
    #[command(about = "Merge batch results into the processing summary")]
    Merge,
}

#[derive(Args)]
struct RunArgs {
    /// Backlog file: JSON entries or a newline accession list.
    backlog: PathBuf,

    #[arg(long)]
    max_samples: Option<usize>,
}

#[derive(Args)]
struct FetchMetadataArgs {
    /// Newline-separated accession list.
    ids: PathBuf,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    metadata: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::MissingConfig
        | PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::BacklogRead(_)
        | PipelineError::BacklogParse(_)
        | PipelineError::InvalidRunAccession(_) => 2,
        PipelineError::TransientNetwork(_)
        | PipelineError::RateLimited { .. }
        | PipelineError::ToolExit { .. }
        | PipelineError::ToolTimeout { .. }
        | PipelineError::MissingTool(_)
        | PipelineError::EutilsHttp(_)
        | PipelineError::EutilsStatus { .. } => 3,
        PipelineError::CorruptCheckpoint { .. } | PipelineError::DiskFull(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;
    let layout = RunLayout::new(config.data_root.clone());

    match cli.command {
        Commands::Run(args) => run_pipeline(args, &config, &layout, false),
        Commands::Resume(args) => run_pipeline(args, &config, &layout, true),
        Commands::FetchMetadata(args) => fetch_metadata(args, &config, &layout),
        Commands::Status(args) => {
            let status = if args.metadata {
                monitor::metadata_status(&layout).into_diagnostic()?
            } else {
                monitor::pipeline_status(&layout).into_diagnostic()?
            };
            JsonOutput::print_status(&status).into_diagnostic()?;
            Ok(())
        }
        Commands::Merge => {
            let summary = aggregate::merge(&layout).into_diagnostic()?;
            cardioseq::store::write_json_atomic(&layout.summary_path(), &summary)
                .into_diagnostic()?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
            Ok(())
        }
    }
}

fn install_cancel_handler() -> miette::Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .into_diagnostic()?;
    Ok(cancel)
}

fn run_pipeline(
    args: RunArgs,
    config: &ResolvedConfig,
    layout: &RunLayout,
    resume: bool,
) -> miette::Result<()> {
    layout.ensure_root().into_diagnostic()?;

    let mut backlog = load_backlog(&args.backlog, config).into_diagnostic()?;
    if let Some(max) = args.max_samples {
        backlog.truncate(max);
    }

    let toolchain = SystemSraToolchain::new(Duration::from_secs(config.step_timeout_secs));
    toolchain.verify_tools().into_diagnostic()?;

    let checkpoint =
        CheckpointStore::load_or_create(&layout.checkpoint_path()).into_diagnostic()?;
    let quota = DiskQuotaGuard::new(config.disk_ceiling_bytes);
    let cancel = install_cancel_handler()?;

    let scheduler = BatchScheduler::new(
        &toolchain,
        layout,
        &checkpoint,
        &quota,
        config.max_parallel_processes,
        config.max_retries,
        &cancel,
    );

    let plan = if resume {
        scheduler
            .resume(&backlog, config.batch_size)
            .into_diagnostic()?
    } else {
        BatchScheduler::plan(&backlog, config.batch_size)
    };

    let context = RunContext::create(layout).into_diagnostic()?;
    let report = scheduler.run(plan).into_diagnostic()?;
    tracing::info!(elapsed_secs = context.elapsed_secs(), "run finished");
    context.teardown().into_diagnostic()?;

    JsonOutput::print_run(&report).into_diagnostic()?;
    Ok(())
}

fn fetch_metadata(
    args: FetchMetadataArgs,
    config: &ResolvedConfig,
    layout: &RunLayout,
) -> miette::Result<()> {
    layout.ensure_root().into_diagnostic()?;

    let content = std::fs::read_to_string(&args.ids)
        .map_err(|_| PipelineError::BacklogRead(args.ids.clone()))
        .into_diagnostic()?;
    let target_ids: Vec<RunAccession> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.parse::<RunAccession>())
        .collect::<Result<_, _>>()
        .into_diagnostic()?;

    let client = HttpEutilsClient::new().into_diagnostic()?;
    let cancel = install_cancel_handler()?;
    let fetcher = MetadataFetcher::new(
        &client,
        layout.metadata_state_path(),
        Duration::from_secs(config.rate_limit_backoff_cap_secs),
        config.max_retries + 1,
        &cancel,
    );

    let context = RunContext::create(layout).into_diagnostic()?;
    let report = fetcher.fetch_all(&target_ids).into_diagnostic()?;
    context.teardown().into_diagnostic()?;

    JsonOutput::print_fetch(&report).into_diagnostic()?;
    Ok(())
}
