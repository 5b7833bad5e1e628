use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use thredds_mirror::definition::DefinitionStore;
use thredds_mirror::error::MirrorError;
use thredds_mirror::metadata::JsonMetadataStore;
use thredds_mirror::notify::{NotifyChannels, WebhookNotifier};
use thredds_mirror::output::JsonOutput;
use thredds_mirror::reconcile::RunOptions;
use thredds_mirror::run::{run, RunRequest};
use thredds_mirror::scan::NetcdfScanner;

#[derive(Parser)]
#[command(name = "thredds-mirror")]
#[command(about = "Mirror datasets from THREDDS catalogues into S3 or a local filesystem")]
#[command(version, author)]
struct Cli {
    /// Directory holding the download definition documents
    #[arg(long, default_value = "definitions")]
    definitions: Utf8PathBuf,

    /// Root directory of the metadata index
    #[arg(long, default_value = "metadata")]
    metadata: Utf8PathBuf,

    /// List the transfers without downloading anything
    #[arg(long)]
    dry_run: bool,

    /// Cap on successful downloads per definition
    /// (negative = unlimited, 0 = download nothing)
    #[arg(long)]
    limit: Option<i32>,

    /// Run a single definition, disabled ones included
    #[arg(long)]
    definition_id: Option<String>,

    /// Comma-separated filenames to download; only with --definition-id
    #[arg(long)]
    files: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run_cli() {
        eprintln!("{report:?}");
        if let Some(mirror) = report.downcast_ref::<MirrorError>() {
            return ExitCode::from(map_exit_code(mirror));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::DefinitionNotFound(_) => 2,
        MirrorError::NoActiveDefinitions => 2,
        _ => 1,
    }
}

fn run_cli() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut dry_run = env_dry_run();
    if cli.dry_run {
        dry_run = true;
    }
    let mut limit = env_limit();
    if let Some(value) = cli.limit {
        limit = value;
    }

    let definition_id = cli
        .definition_id
        .or_else(|| env_string("DOWNLOADDEFINITIONID"));
    let mut files = cli
        .files
        .or_else(|| env_string("FILES"))
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|entries| !entries.is_empty());
    if files.is_some() && definition_id.is_none() {
        warn!("the files parameter only works together with a definition id, ignoring it");
        files = None;
    }

    let channels = NotifyChannels {
        download_complete: env_string("DOWNLOAD_COMPLETE_TOPIC"),
        all_download_complete: env_string("ALL_DOWNLOAD_COMPLETE_TOPIC"),
        administration: env_string("ADMINISTRATION_TOPIC"),
    };
    let notifier = WebhookNotifier::new(channels)?;

    let definitions = DefinitionStore::new(cli.definitions);
    let metadata = JsonMetadataStore::new(cli.metadata);
    let scanner = NetcdfScanner::new();
    let request = RunRequest {
        definition_id,
        files,
        options: RunOptions { dry_run, limit },
    };

    let summary = run(&definitions, &metadata, &scanner, &notifier, &request)?;
    JsonOutput::print_summary(&summary).into_diagnostic()?;
    Ok(())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("null"))
}

/// DRYRUN accepts "true" and "false". Anything else is suspicious enough to
/// refuse to download: warn and run dry.
fn env_dry_run() -> bool {
    match env_string("DRYRUN") {
        None => false,
        Some(value) if value.eq_ignore_ascii_case("false") => false,
        Some(value) if value.eq_ignore_ascii_case("true") => true,
        Some(value) => {
            warn!(%value, "invalid DRYRUN environment variable, expected TRUE or FALSE");
            warn!("dryrun was set to true (to be safe)");
            true
        }
    }
}

fn env_limit() -> i32 {
    match env_string("LIMIT") {
        None => -1,
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(%value, "invalid LIMIT environment variable, expected an integer");
            -1
        }),
    }
}
