use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sample_upload::backend::{HttpBackend, SampleBackend};
use sample_upload::concat::LaneConcatenator;
use sample_upload::config::{CONFIG_FILE, ConfigLoader, ResolvedConfig};
use sample_upload::domain::{SampleStatus, Technology};
use sample_upload::error::UploadError;
use sample_upload::grouper::{FileGrouper, dedupe_names};
use sample_upload::inspector::{FormatInspector, NativeInspector, SystemInspector};
use sample_upload::manager::{EventSink, SampleUploadEvent, UploadOptions, UploadSessionManager};
use sample_upload::output::{HumanOutput, JsonOutput, OutputMode, SessionListing, format_bytes};
use sample_upload::progress::{BatchState, Percentage};
use sample_upload::s3::S3Connector;
use sample_upload::sample::LogicalSample;
use sample_upload::session::UploadSession;
use sample_upload::source::RawFile;
use sample_upload::store::SessionStore;
use sample_upload::validator::{PreUploadValidator, ValidationOutcome, ValidationReport};

#[derive(Parser)]
#[command(name = "sample-upload")]
#[command(about = "Group, check and upload local sequencing samples")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON instead of the human summary.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    project_id: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Group files into samples and run the pre-upload checks")]
    Inspect(InputArgs),
    #[command(about = "Check and upload samples")]
    Upload(InputArgs),
    #[command(about = "Retry failed samples of a stored upload session")]
    Resume(ResumeArgs),
    #[command(about = "List stored upload sessions")]
    Sessions,
    #[command(about = "Write a sample-upload.json in the current directory")]
    Init(InitArgs),
}

#[derive(Args)]
struct InputArgs {
    /// Files or directories holding FASTA/FASTQ files.
    #[arg(required = true)]
    paths: Vec<String>,

    #[arg(long)]
    technology: Option<Technology>,

    #[arg(long)]
    host_genome: Option<String>,
}

#[derive(Args)]
struct ResumeArgs {
    batch_id: String,

    #[arg(long, conflicts_with = "sample")]
    all_failed: bool,

    #[arg(long = "sample")]
    sample: Vec<String>,
}

#[derive(Args)]
struct InitArgs {
    #[arg(long)]
    base_url: String,

    #[arg(long)]
    force: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<UploadError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &UploadError) -> u8 {
    match error {
        UploadError::InvalidTechnology(_)
        | UploadError::UnsupportedFile(_)
        | UploadError::GroupingAmbiguity(_)
        | UploadError::MissingConfig
        | UploadError::ConfigRead(_)
        | UploadError::ConfigParse(_)
        | UploadError::ConfigValue(_)
        | UploadError::Filesystem(_)
        | UploadError::SessionNotFound(_)
        | UploadError::UnknownSample(_)
        | UploadError::NotUploadable { .. }
        | UploadError::NoValidSamples => 2,
        UploadError::Registration(_)
        | UploadError::BackendStatus { .. }
        | UploadError::BackendHttp(_)
        | UploadError::Credential(_)
        | UploadError::Transfer(_)
        | UploadError::TransferStatus { .. }
        | UploadError::MarkComplete(_)
        | UploadError::Heartbeat(_) => 3,
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
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Inspect(args) => {
            let config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;
            run_inspect(args, &config, cli.project_id, output_mode)
        }
        Commands::Upload(args) => {
            let config = ConfigLoader::resolve(cli.config.as_deref())?;
            run_upload(args, &config, cli.project_id, output_mode)
        }
        Commands::Resume(args) => {
            let config = ConfigLoader::resolve(cli.config.as_deref())?;
            run_resume(args, &config, output_mode)
        }
        Commands::Sessions => run_sessions(output_mode),
        Commands::Init(args) => run_init(args),
    }
}

fn run_inspect(
    args: InputArgs,
    config: &ResolvedConfig,
    project_id: Option<u64>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let technology = args.technology.unwrap_or(config.technology);
    let grouper = FileGrouper::new(
        project_id.or(config.project_id),
        args.host_genome.or_else(|| config.host_genome.clone()),
    );
    let outcome = grouper.group(collect_files(&args.paths)?);
    if matches!(output_mode, OutputMode::Human) {
        HumanOutput::print_rejected(&outcome.rejected);
    }
    let samples = LaneConcatenator.concatenate_all(&outcome.samples);
    let report = check(&samples, technology)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_report(&report),
    }
    if report.summary.is_some() {
        return Err(UploadError::NoValidSamples.into());
    }
    Ok(())
}

fn run_upload(
    args: InputArgs,
    config: &ResolvedConfig,
    project_id: Option<u64>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let technology = args.technology.unwrap_or(config.technology);
    let project_id = project_id.or(config.project_id);
    let backend = HttpBackend::from_env(config.require_base_url()?)?;

    let grouper = FileGrouper::new(
        project_id,
        args.host_genome.or_else(|| config.host_genome.clone()),
    );
    let outcome = grouper.group(collect_files(&args.paths)?);
    if matches!(output_mode, OutputMode::Human) {
        HumanOutput::print_rejected(&outcome.rejected);
    }

    let samples = match project_id {
        Some(project_id) => {
            let names = outcome
                .samples
                .iter()
                .map(|sample| sample.name.clone())
                .collect::<Vec<_>>();
            let taken = backend.existing_sample_names(project_id, &names)?;
            if !taken.is_empty() {
                info!(taken = taken.len(), "renaming samples that already exist in the project");
            }
            dedupe_names(outcome.samples, &taken)
        }
        None => dedupe_names(outcome.samples, &HashSet::new()),
    };

    let samples = LaneConcatenator.concatenate_all(&samples);
    let report = check(&samples, technology)?;
    if matches!(output_mode, OutputMode::Human) {
        HumanOutput::print_report(&report);
    }
    if report.summary.is_some() {
        return Err(UploadError::NoValidSamples.into());
    }
    let selected = report
        .apply(&samples)
        .into_iter()
        .filter(|sample| sample.status == SampleStatus::Valid)
        .collect::<Vec<_>>();

    let manager = build_manager(backend, config)?;
    let sink = ConsoleSink::new(&selected, output_mode);
    let session = manager.upload(&selected, &sink)?;
    finish(&session, output_mode)
}

fn run_resume(args: ResumeArgs, config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let store = SessionStore::new()?;
    let mut session = store.load(&args.batch_id)?;
    let names = if args.all_failed || args.sample.is_empty() {
        session.failed_names()
    } else {
        args.sample
    };
    if names.is_empty() {
        if matches!(output_mode, OutputMode::Human) {
            println!("Nothing to resume in {}.", session.batch_id);
        }
        return finish(&session, output_mode);
    }

    let backend = HttpBackend::from_env(config.require_base_url()?)?;
    let manager = build_manager(backend, config)?;
    let sink = ConsoleSink::from_session(&session, output_mode);
    manager.resume(&mut session, &names, &sink)?;
    finish(&session, output_mode)
}

fn run_sessions(output_mode: OutputMode) -> miette::Result<()> {
    let store = SessionStore::new()?;
    let listings = store
        .list()?
        .iter()
        .map(SessionListing::from_session)
        .collect::<Vec<_>>();
    match output_mode {
        OutputMode::Json => JsonOutput::print_sessions(&listings).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_sessions(&listings),
    }
    Ok(())
}

fn run_init(args: InitArgs) -> miette::Result<()> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() && !args.force {
        return Err(miette::Report::msg(format!(
            "{CONFIG_FILE} already exists (use --force to overwrite)"
        )));
    }
    ConfigLoader::write_default(path, &args.base_url)?;
    println!("wrote {CONFIG_FILE}");
    Ok(())
}

fn build_manager(
    backend: HttpBackend,
    config: &ResolvedConfig,
) -> miette::Result<UploadSessionManager<HttpBackend, S3Connector>> {
    let storage = S3Connector {
        endpoint: config.object_store_endpoint.clone(),
        accelerate: config.accelerate,
        max_retries: config.max_part_retries,
    };
    let options = UploadOptions {
        part_size: config.part_size,
        heartbeat_interval: config.heartbeat_interval,
        keep_awake: true,
    };
    Ok(UploadSessionManager::new(backend, storage, options).with_store(SessionStore::new()?))
}

fn finish(session: &UploadSession, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_session(session).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_upload_summary(session),
    }
    let failed = session.failed_names();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(miette::Report::msg(format!(
            "{} of {} samples failed to upload",
            failed.len(),
            session.samples.len()
        )))
    }
}

fn check(samples: &[LogicalSample], technology: Technology) -> miette::Result<ValidationReport> {
    let validator = PreUploadValidator::new(inspector());
    match validator.validate(samples, technology) {
        ValidationOutcome::Completed(report) => Ok(report),
        // Only one validate call runs per process.
        ValidationOutcome::Superseded => Err(miette::Report::msg("validation was superseded")),
    }
}

fn inspector() -> Box<dyn FormatInspector> {
    match SystemInspector::new() {
        Ok(inspector) => Box::new(inspector),
        Err(err) => {
            debug!(error = %err, "using built-in format inspector");
            Box::new(NativeInspector)
        }
    }
}

fn collect_files(paths: &[String]) -> miette::Result<Vec<RawFile>> {
    let mut files = Vec::new();
    for path in paths {
        let path = Utf8Path::new(path);
        if path.is_dir() {
            let mut entries = fs::read_dir(path.as_std_path())
                .into_diagnostic()?
                .filter_map(Result::ok)
                .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
                .filter(|entry| entry.is_file())
                .collect::<Vec<_>>();
            entries.sort();
            for entry in entries {
                files.push(RawFile::open(&entry)?);
            }
        } else {
            files.push(RawFile::open(path)?);
        }
    }
    Ok(files)
}

struct ConsoleSink {
    state: Mutex<BatchState>,
    mode: OutputMode,
}

impl ConsoleSink {
    fn new(samples: &[LogicalSample], mode: OutputMode) -> Self {
        Self {
            state: Mutex::new(BatchState::new(samples.iter().map(|sample| &sample.name))),
            mode,
        }
    }

    fn from_session(session: &UploadSession, mode: OutputMode) -> Self {
        Self {
            state: Mutex::new(BatchState::from_session(session)),
            mode,
        }
    }
}

impl EventSink for ConsoleSink {
    fn event(&self, event: SampleUploadEvent) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = state.apply(&event);
        if matches!(self.mode, OutputMode::Json) {
            return;
        }
        match &event {
            SampleUploadEvent::Started { sample, .. } => eprintln!("uploading {sample}"),
            SampleUploadEvent::FileCompleted { sample, file } => {
                let done = match state.percentage(sample) {
                    Some(Percentage::Fraction(fraction)) => format!("{:.0}%", fraction * 100.0),
                    _ => "-".to_string(),
                };
                eprintln!("  {file} done ({done} of {sample})");
            }
            SampleUploadEvent::SampleSucceeded { sample, .. } => {
                let bytes = state
                    .sample(sample)
                    .map(|progress| progress.files.values().map(|file| file.total_bytes).sum())
                    .unwrap_or(0);
                eprintln!("  {sample} uploaded ({})", format_bytes(bytes));
            }
            SampleUploadEvent::SampleFailed { sample, message, .. } => {
                eprintln!("  {sample} failed: {message}");
            }
            _ => {}
        }
    }
}
