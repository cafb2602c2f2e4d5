use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fs2::FileExt;
use indicatif::ProgressStyle;
use tracing::{info, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_indicatif::{span_ext::IndicatifSpanExt, IndicatifLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vdna_batch::config::{
    default_workers, CommandTemplate, DeviceSpec, PipelineConfig, DEFAULT_COMPRESS_THRESHOLD,
};
use vdna_batch::pipeline::Pipeline;
use vdna_batch::registry::TaskRegistry;
use vdna_batch::report::{ProgressReporter, ReportPaths};
use vdna_batch::toolchain::ShellToolchain;
use vdna_batch::vddb::{self, VddbClient};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const LOCK_FILE: &str = "vdna-batch.lock";

#[derive(Parser)]
#[command(version, about = "Batch fingerprint generation and database upkeep")]
struct Cli {
    /// Also write logs to this file.
    #[arg(long, global = true, env = "VDNA_BATCH_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress oversized sources and generate fingerprint artifacts.
    Create(CreateArgs),
    /// Insert artifacts into the database.
    Upload(UploadArgs),
    /// Query the database with artifacts and write a match report.
    Match(MatchArgs),
    /// Remove previously inserted artifacts from the database.
    Delete(DeleteArgs),
}

#[derive(Args)]
struct CreateArgs {
    /// A media directory, or a file listing one source path per line.
    #[arg(short, long)]
    input: PathBuf,

    /// Where artifacts are written.
    #[arg(short, long)]
    output_dir: PathBuf,

    #[arg(long, default_value = "/tmp/vdna-batch")]
    cache: PathBuf,

    /// Fingerprint workers [default: two thirds of the cores, plus one].
    #[arg(short, long)]
    num_workers: Option<usize>,

    /// Compression device as ID:CAPACITY; ID is -1 for the CPU or a GPU index.
    #[arg(long = "device", allow_hyphen_values = true)]
    devices: Vec<DeviceSpec>,

    /// Pixel area above which sources are compressed first.
    #[arg(long, default_value_t = DEFAULT_COMPRESS_THRESHOLD)]
    compress_threshold: u64,

    /// Keep compressed copies left over from earlier runs.
    #[arg(long)]
    no_compress_rebuild: bool,

    /// Keep artifacts left over from earlier runs.
    #[arg(long)]
    no_fingerprint_rebuild: bool,

    #[arg(long, default_value = "1s")]
    poll_interval: humantime::Duration,

    /// CPU compression command, with {src} and {dst} placeholders.
    #[arg(long)]
    cpu_compress_cmd: Option<CommandTemplate>,

    /// GPU compression command, with {src}, {dst}, {gpu_id} and {codec} placeholders.
    #[arg(long)]
    gpu_compress_cmd: Option<CommandTemplate>,

    /// Fingerprint command, with {src} and {dst} placeholders.
    #[arg(long)]
    fingerprint_cmd: Option<CommandTemplate>,

    #[arg(long)]
    probe_program: Option<String>,

    /// Directory for the path manifest and the report table.
    #[arg(long, default_value = ".")]
    report_dir: PathBuf,
}

#[derive(Args)]
struct ServiceArgs {
    #[arg(short = 's', long, env = "VDDB_HOST")]
    host: String,

    #[arg(short, long, env = "VDDB_USER")]
    user: String,

    #[arg(short, long, env = "VDDB_PASSWORD", hide_env_values = true)]
    password: String,

    /// Fingerprint CLI used for inserts and deletes.
    #[arg(long)]
    program: Option<String>,
}

impl ServiceArgs {
    fn client(&self, cache: &Path) -> VddbClient {
        let client = VddbClient::new(&self.host, &self.user, &self.password, cache);
        match &self.program {
            Some(program) => client.with_program(program),
            None => client,
        }
    }
}

#[derive(Args)]
struct UploadArgs {
    #[command(flatten)]
    service: ServiceArgs,

    /// File listing one artifact path per line.
    #[arg(short, long)]
    file: PathBuf,
}

#[derive(Args)]
struct MatchArgs {
    #[command(flatten)]
    service: ServiceArgs,

    /// An artifact directory, or a file listing one artifact per line.
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long, default_value_t = 4)]
    num_workers: usize,

    /// Query tool, e.g. "python2 FarQuerySampleCode.py".
    #[arg(long, default_value = "FarQuerySampleCode")]
    query_program: String,

    #[arg(long, default_value = "batch_far_match_report.csv")]
    report: PathBuf,
}

#[derive(Args)]
struct DeleteArgs {
    #[command(flatten)]
    service: ServiceArgs,

    /// An artifact directory, or a file listing one artifact per line.
    #[arg(short, long)]
    input: PathBuf,

    #[arg(long, default_value = "/tmp/far_db_remove")]
    cache: PathBuf,
}

fn expand(path: &Path) -> PathBuf {
    shellexpand::path::tilde(path).into_owned()
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().context("log file path has no file name")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory '{}'", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Held for the life of the process; a second `create` on the same cache fails.
fn lock_cache(cache: &Path) -> Result<File> {
    std::fs::create_dir_all(cache).with_context(|| format!("create cache '{}'", cache.display()))?;
    let path = cache.join(LOCK_FILE);
    let file = File::create(&path).with_context(|| format!("open lock file '{}'", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("already running (lock held on '{}')", path.display()))?;
    Ok(file)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    human_panic::setup_panic!();
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref().map(expand).as_deref())?;

    match cli.command {
        Command::Create(args) => create(args).await,
        Command::Upload(args) => upload(args).await,
        Command::Match(args) => query(args).await,
        Command::Delete(args) => delete(args).await,
    }
}

async fn create(args: CreateArgs) -> Result<()> {
    let input = expand(&args.input);
    let output_dir = expand(&args.output_dir);
    let cache = expand(&args.cache);
    let _lock = lock_cache(&cache)?;

    let mut config = PipelineConfig::new(&cache)
        .with_devices(args.devices)
        .with_workers(args.num_workers.unwrap_or_else(default_workers))
        .with_poll_interval(args.poll_interval.into());
    config.compress_threshold = args.compress_threshold;
    config.compress_rebuild = !args.no_compress_rebuild;
    config.fingerprint_rebuild = !args.no_fingerprint_rebuild;
    if let Some(template) = args.cpu_compress_cmd {
        config.templates.cpu_compress = template;
    }
    if let Some(template) = args.gpu_compress_cmd {
        config.templates.gpu_compress = template;
    }
    if let Some(template) = args.fingerprint_cmd {
        config.templates.fingerprint = template;
    }
    if let Some(program) = args.probe_program {
        config.templates.probe_program = program;
    }
    let config = Arc::new(config);
    info!(devices = ?config.devices, workers = config.workers, "Starting");

    let tools = Arc::new(ShellToolchain::new(config.templates.clone()));
    info!("Discovering media to fingerprint...");
    let registry = TaskRegistry::discover(&input, &output_dir, &config, tools.as_ref())
        .await
        .context("discover sources")?;
    info!("Registered {} tasks", registry.len());

    let paths = ReportPaths::new(&expand(&args.report_dir), "batch_far_create");
    paths.prepare().await?;
    let pipeline = Pipeline::new(config, tools, registry, ProgressReporter::new(Some(paths))).await;

    let header_span = info_span!("header");
    header_span.pb_set_style(&ProgressStyle::default_bar());
    header_span.pb_set_length(pipeline.scheduled() as u64);

    let rows = pipeline.run().instrument(header_span).await?;
    let succeeded = rows.iter().filter(|r| r.status == "success").count();
    info!("{succeeded} of {} tasks fingerprinted", rows.len());
    Ok(())
}

async fn upload(args: UploadArgs) -> Result<()> {
    let client = args.service.client(&std::env::temp_dir());
    let artifacts = vddb::collect_artifacts(&expand(&args.file)).await?;
    let summary = vddb::upload_all(&client, &artifacts).await?;
    info!(
        inserted = summary.succeeded,
        skipped = summary.skipped,
        failed = summary.failed,
        "Upload finished"
    );
    Ok(())
}

async fn query(args: MatchArgs) -> Result<()> {
    let client = args
        .service
        .client(&std::env::temp_dir())
        .with_query_program(&args.query_program);
    let artifacts = vddb::collect_artifacts(&expand(&args.input)).await?;
    let rows = vddb::match_all(&client, &artifacts, args.num_workers).await;
    let report = expand(&args.report);
    vddb::write_match_table(&rows, &report)?;
    info!(rows = rows.len(), report = %report.display(), "Match report written");
    Ok(())
}

async fn delete(args: DeleteArgs) -> Result<()> {
    let client = args.service.client(&expand(&args.cache));
    let artifacts = vddb::collect_artifacts(&expand(&args.input)).await?;
    let summary = vddb::delete_all(&client, &artifacts).await?;
    info!(
        deleted = summary.succeeded,
        skipped = summary.skipped,
        failed = summary.failed,
        "Delete finished"
    );
    Ok(())
}
