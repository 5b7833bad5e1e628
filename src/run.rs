use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{error, info};

use crate::definition::{DefinitionStore, DownloadDefinition};
use crate::error::MirrorError;
use crate::metadata::MetadataStore;
use crate::notify::Notifier;
use crate::reconcile::{DownloadOutput, Reconciler, RunOptions};
use crate::scan::DatasetScanner;
use crate::sink;

/// One worker invocation, assembled by the binary from arguments and
/// environment.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Restrict the run to one definition, disabled ones included.
    pub definition_id: Option<String>,
    /// Only meaningful together with `definition_id`: replaces the
    /// definition's filename filter.
    pub files: Option<Vec<String>>,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefinitionCounts {
    #[serde(rename = "downloadedFiles")]
    pub downloaded_files: usize,
    #[serde(rename = "warningMessages")]
    pub warning_messages: usize,
    #[serde(rename = "errorMessages")]
    pub error_messages: usize,
}

/// Aggregate over all definitions that produced a non-empty summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    #[serde(rename = "downloadDefinitions")]
    pub definitions: BTreeMap<String, DefinitionCounts>,
}

impl RunSummary {
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Walk the selected definitions sequentially and reconcile each one. A
/// definition that fails is logged and skipped; the others still run.
pub fn run<S: DatasetScanner, N: Notifier>(
    definitions: &DefinitionStore,
    metadata: &dyn MetadataStore,
    scanner: &S,
    notifier: &N,
    request: &RunRequest,
) -> Result<RunSummary, MirrorError> {
    info!(
        definition_id = request.definition_id.as_deref().unwrap_or("<all enabled>"),
        limit = request.options.limit,
        dry_run = request.options.dry_run,
        "download manager task summary"
    );

    let selected = select_definitions(definitions, request)?;
    if selected.is_empty() {
        // Nothing runs at all: this has to surface as a non-zero exit.
        return Err(MirrorError::NoActiveDefinitions);
    }

    let mut outputs: BTreeMap<String, DownloadOutput> = BTreeMap::new();
    for definition in &selected {
        match reconcile_definition(definition, metadata, scanner, notifier, request) {
            Ok(output) => {
                log_output(&definition.id, &output);
                if !output.is_empty() {
                    outputs.insert(definition.id.clone(), output);
                }
            }
            Err(err) => {
                error!(
                    definition = %definition.id,
                    error = %err,
                    "download definition failed"
                );
            }
        }
    }

    if !outputs.is_empty() {
        notifier.run_complete(&outputs);
    }

    let mut summary = RunSummary::default();
    for (definition_id, output) in &outputs {
        summary.definitions.insert(
            definition_id.clone(),
            DefinitionCounts {
                downloaded_files: output.success.len(),
                warning_messages: output.warnings.len(),
                error_messages: output.errors.len(),
            },
        );
    }
    Ok(summary)
}

fn select_definitions(
    definitions: &DefinitionStore,
    request: &RunRequest,
) -> Result<Vec<DownloadDefinition>, MirrorError> {
    match &request.definition_id {
        Some(id) => {
            let definition = definitions
                .get(id)?
                .ok_or_else(|| MirrorError::DefinitionNotFound(id.clone()))?;
            let definition = match &request.files {
                Some(files) if !files.is_empty() => definition.with_files(files.clone()),
                _ => definition,
            };
            Ok(vec![definition])
        }
        None => definitions.list_enabled(),
    }
}

fn reconcile_definition<S: DatasetScanner, N: Notifier>(
    definition: &DownloadDefinition,
    metadata: &dyn MetadataStore,
    scanner: &S,
    notifier: &N,
    request: &RunRequest,
) -> Result<DownloadOutput, MirrorError> {
    let output_config = definition
        .output
        .as_ref()
        .ok_or_else(|| MirrorError::InvalidDefinition {
            id: definition.id.clone(),
            message: "the definition has no output".to_string(),
        })?;
    let sink = sink::sink_for(output_config.output_type)?;
    let reconciler = Reconciler::new(
        definition,
        metadata,
        sink.as_ref(),
        scanner,
        notifier,
        request.options.clone(),
    );
    reconciler.reconcile()
}

fn log_output(definition_id: &str, output: &DownloadOutput) {
    if output.is_empty() {
        return;
    }
    info!(definition = definition_id, "downloaded files:");
    for record in &output.success {
        info!("- {}", record.file_uri);
    }
    if !output.warnings.is_empty() {
        info!("warnings:");
        for warning in &output.warnings {
            info!("- {warning}");
        }
    }
    if !output.errors.is_empty() {
        info!("errors:");
        for message in &output.errors {
            info!("- {message}");
        }
    }
}
