use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bioarchive_ingest::catalog::CkanHttpClient;
use bioarchive_ingest::config::ConfigLoader;
use bioarchive_ingest::error::SyncError;
use bioarchive_ingest::multihash::{DEFAULT_CHUNK_SIZE, hash_file};
use bioarchive_ingest::output::{HashEntry, JsonOutput};
use bioarchive_ingest::probe::HttpArchiveProbe;
use bioarchive_ingest::producer::ManifestProducer;
use bioarchive_ingest::sync::{CancelToken, Reconciler};
use bioarchive_ingest::upload::HttpOriginSource;

const CATALOG_RPC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "bioarchive-sync")]
#[command(about = "Reconcile computed archive metadata against the data catalog")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Sync one data-type manifest into the catalog")]
    Sync(SyncArgs),
    #[command(about = "Print md5, sha256 and multipart ETags of local files")]
    Hash(HashArgs),
}

#[derive(Args)]
struct SyncArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    manifest: String,

    #[arg(long)]
    no_verify: bool,

    #[arg(long)]
    no_upload: bool,

    #[arg(long)]
    delete: bool,
}

#[derive(Args)]
struct HashArgs {
    #[arg(required = true)]
    files: Vec<String>,

    #[arg(long = "chunk-size")]
    chunk_sizes: Vec<u64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingConfig
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::InvalidConfig(_)
        | SyncError::ManifestRead { .. }
        | SyncError::MissingLinkageKey { .. }
        | SyncError::LinkageCollision { .. }
        | SyncError::DuplicateResourceMd5 { .. }
        | SyncError::MissingResourceMd5 { .. }
        | SyncError::InvalidChunkSize(_) => 2,
        SyncError::CatalogNotFound { .. }
        | SyncError::CatalogConflict { .. }
        | SyncError::CatalogAuth { .. }
        | SyncError::CatalogTransport(_)
        | SyncError::UnsupportedAction { .. }
        | SyncError::CatalogServer { .. }
        | SyncError::ProbeAuth { .. }
        | SyncError::OriginHttp { .. }
        | SyncError::OriginStatus { .. } => 3,
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
    match cli.command {
        Commands::Sync(args) => run_sync(args),
        Commands::Hash(args) => run_hash(args),
    }
}

fn run_sync(args: SyncArgs) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let mut options = resolved.options;
    if args.no_verify {
        options.do_verify = false;
    }
    if args.no_upload {
        options.do_upload = false;
    }
    if args.delete {
        options.do_delete = true;
    }

    let producer = ManifestProducer::load(Path::new(&args.manifest))?;
    let catalog = CkanHttpClient::new(&resolved.catalog, CATALOG_RPC_TIMEOUT)?;
    let uploads = CkanHttpClient::for_uploads(&resolved.catalog, resolved.upload_idle_timeout)?;
    let probe = HttpArchiveProbe::new(
        &resolved.catalog,
        resolved.origin_credentials.clone(),
        resolved.probe_timeout,
    )?;
    let origin = HttpOriginSource::new(
        resolved.origin_credentials.clone(),
        resolved.upload_idle_timeout,
    )?;

    let reconciler = Reconciler::new(
        &catalog,
        &probe,
        &origin,
        resolved.staging_dir.as_std_path(),
    )
    .with_upload_catalog(&uploads);
    let report = reconciler.sync_producer(&producer, options, &CancelToken::new())?;
    JsonOutput::print_report(&report).into_diagnostic()?;
    Ok(())
}

fn run_hash(args: HashArgs) -> miette::Result<()> {
    let chunk_sizes = if args.chunk_sizes.is_empty() {
        vec![DEFAULT_CHUNK_SIZE]
    } else {
        args.chunk_sizes
    };

    let mut entries = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let path = Path::new(file);
        let size = fs::metadata(path)
            .map_err(|err| SyncError::Filesystem(format!("{file}: {err}")))?
            .len();
        let hash = hash_file(path, &chunk_sizes)?;
        entries.push(HashEntry::new(file.as_str(), size, &hash));
    }
    JsonOutput::print_hashes(&entries).into_diagnostic()?;
    Ok(())
}
