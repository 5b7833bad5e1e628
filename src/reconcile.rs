//! Per-definition reconciliation: diff the catalogue against the metadata
//! index and run the download-verify-publish pipeline for outdated entries.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::capacity;
use crate::catalogue::{CatalogueLoader, DatasetEntry};
use crate::definition::{DownloadDefinition, Output};
use crate::domain::{now_millis, unique_dataset_id, Status};
use crate::error::MirrorError;
use crate::fetch;
use crate::metadata::{DatasetMetadata, MetadataStore};
use crate::notify::Notifier;
use crate::scan::DatasetScanner;
use crate::sink::Sink;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Negative = unlimited, 0 = do nothing, positive = cap on successful
    /// downloads for this definition.
    pub limit: i32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            limit: -1,
        }
    }
}

/// Per-definition summary: three disjoint lists.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadOutput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<DatasetMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl DownloadOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.success.is_empty() && self.warnings.is_empty() && self.errors.is_empty()
    }
}

/// Outcome of one pass through the per-dataset pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// A new object was published; consumes limit quota.
    Downloaded,
    /// Nothing was published; the reason is already in the summary.
    Skipped,
    /// Unrecoverable for this definition; surface the partial summary.
    Halted,
}

/// Removes whatever temporary files the pipeline produced, on every exit
/// path including unwinds.
struct TempGuard {
    paths: Vec<PathBuf>,
}

impl TempGuard {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if path.exists() {
                debug!(path = %path.display(), "deleting temporary file");
                if let Err(err) = fs::remove_file(path) {
                    error!(
                        path = %path.display(),
                        error = %err,
                        "can not delete the temporary file"
                    );
                }
            }
        }
    }
}

pub struct Reconciler<'a, S: DatasetScanner, N: Notifier> {
    definition: &'a DownloadDefinition,
    store: &'a dyn MetadataStore,
    sink: &'a dyn Sink,
    scanner: &'a S,
    notifier: &'a N,
    options: RunOptions,
}

impl<'a, S: DatasetScanner, N: Notifier> Reconciler<'a, S, N> {
    pub fn new(
        definition: &'a DownloadDefinition,
        store: &'a dyn MetadataStore,
        sink: &'a dyn Sink,
        scanner: &'a S,
        notifier: &'a N,
        options: RunOptions,
    ) -> Self {
        Self {
            definition,
            store,
            sink,
            scanner,
            notifier,
            options,
        }
    }

    /// Converge the sink and metadata index to the catalogue for this
    /// definition. The definition notification fires on every exit path
    /// with a non-empty summary.
    pub fn reconcile(&self) -> Result<DownloadOutput, MirrorError> {
        let output_config = self.definition.output.as_ref().ok_or_else(|| {
            MirrorError::InvalidDefinition {
                id: self.definition.id.clone(),
                message: "the definition has no output".to_string(),
            }
        })?;

        let mut output = DownloadOutput::new();
        if self.options.limit == 0 {
            return Ok(output);
        }

        let mut loader = CatalogueLoader::new(self.definition);
        let datasets = loader.datasets()?;
        if datasets.is_empty() {
            return Err(MirrorError::NoCatalogue(self.definition.id.clone()));
        }

        let old_records: HashMap<String, DatasetMetadata> = self
            .store
            .list(&self.definition.id)?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let result = self.reconcile_datasets(output_config, &datasets, &old_records, &mut output);

        if !output.is_empty() {
            self.notifier
                .definition_complete(&self.definition.id, &output);
        }
        result?;
        Ok(output)
    }

    fn reconcile_datasets(
        &self,
        output_config: &Output,
        datasets: &std::collections::BTreeMap<String, DatasetEntry>,
        old_records: &HashMap<String, DatasetMetadata>,
        output: &mut DownloadOutput,
    ) -> Result<(), MirrorError> {
        let mut counter = self.options.limit;

        // BTreeMap iteration gives the sorted dataset-id order the logs and
        // the tests rely on.
        for (dataset_id, entry) in datasets {
            let unique_id = unique_dataset_id(&self.definition.id, dataset_id);
            let final_filename = if archive::is_archived(&entry.filename) {
                archive::unpacked_filename(&entry.filename)
            } else {
                &entry.filename
            };
            let dest_uri =
                output_config.destination_uri(entry.sub_directory.as_deref(), final_filename);

            // Lookup by the canonical key: records written before key
            // sanitisation carry a different spelling and stay invisible.
            let old = old_records.get(&unique_id);

            match old {
                Some(old) if entry.last_modified <= old.last_modified => {
                    debug!(id = %unique_id, "the dataset file is up to date");
                    self.verify_dataset(old, &dest_uri)?;
                    continue;
                }
                Some(old) => {
                    info!(
                        id = %unique_id,
                        stored = old.last_modified,
                        advertised = entry.last_modified,
                        "the dataset file is outdated"
                    );
                }
                None => {
                    info!(id = %unique_id, "the dataset file has no metadata record");
                }
            }

            let outcome =
                self.download_dataset(output_config, entry, old, &dest_uri, output)?;
            match outcome {
                Outcome::Downloaded => {
                    if self.options.limit > 0 {
                        counter -= 1;
                        if counter <= 0 {
                            break;
                        }
                    }
                }
                Outcome::Skipped => {}
                Outcome::Halted => break,
            }
        }

        Ok(())
    }

    /// The stored record is current; make sure the object still exists in
    /// the sink, flipping the record to DELETED when it is gone.
    /// Tombstones are not re-probed.
    fn verify_dataset(
        &self,
        old: &DatasetMetadata,
        dest_uri: &str,
    ) -> Result<(), MirrorError> {
        if matches!(old.status, Status::Deleted | Status::Corrupted) {
            return Ok(());
        }
        if self.sink.exists(dest_uri)? {
            return Ok(());
        }
        info!(id = %old.id, uri = dest_uri, "destination object is gone, marking record deleted");
        let mut updated = old.clone();
        updated.status = Status::Deleted;
        self.store.upsert(&updated)
    }

    fn download_dataset(
        &self,
        output_config: &Output,
        entry: &DatasetEntry,
        old: Option<&DatasetMetadata>,
        dest_uri: &str,
        output: &mut DownloadOutput,
    ) -> Result<Outcome, MirrorError> {
        let temp_path = output_config.download_path(&entry.filename);
        let temp_path = temp_path.as_std_path();

        // Stage 1: space check.
        let Some(download_dir) = temp_path.parent() else {
            output.errors.push(format!(
                "Invalid temporary file path {} for file URI: {}",
                temp_path.display(),
                entry.source_uri
            ));
            return Ok(Outcome::Halted);
        };
        if let Err(err) = fs::create_dir_all(download_dir) {
            error!(dir = %download_dir.display(), error = %err, "can not create the download directory");
            output.errors.push(format!(
                "Can not create the directory for the temporary file {}, file URI: {}",
                download_dir.display(),
                entry.source_uri
            ));
            return Ok(Outcome::Halted);
        }

        let file_size_mb = capacity::to_megabytes(entry.size_bytes);
        match capacity::usable_space(download_dir) {
            Ok(free_space) => {
                let free_space_mb = capacity::to_megabytes(free_space);
                info!(
                    dir = %download_dir.display(),
                    free_mb = free_space_mb,
                    file_mb = file_size_mb,
                    "space left before downloading"
                );
                if entry.size_bytes > free_space {
                    error!(
                        uri = %entry.source_uri,
                        "not enough space left on device to download the file"
                    );
                    self.notifier
                        .disk_full(&entry.source_uri, file_size_mb, free_space_mb);
                    output.warnings.push(format!(
                        "Not enough disk space to download the file URI: {}. File size: {:.1} MB, free space: {:.1} MB",
                        entry.source_uri, file_size_mb, free_space_mb
                    ));
                    return Ok(Outcome::Skipped);
                }
            }
            Err(err) => {
                // Proceed without the check; the transport cap still bounds
                // the write.
                warn!(dir = %download_dir.display(), error = %err, "free-space probe failed");
            }
        }

        // Stage 2: dry run.
        if self.options.dry_run {
            info!(
                source = %entry.source_uri,
                destination = dest_uri,
                size_mb = file_size_mb,
                "DRY RUN: file would be downloaded"
            );
            return Ok(Outcome::Downloaded);
        }

        let mut guard = TempGuard::new();
        guard.track(temp_path.to_path_buf());
        self.download_dataset_file(entry, old, dest_uri, temp_path, &mut guard, output)
    }

    fn download_dataset_file(
        &self,
        entry: &DatasetEntry,
        old: Option<&DatasetMetadata>,
        dest_uri: &str,
        temp_path: &Path,
        guard: &mut TempGuard,
        output: &mut DownloadOutput,
    ) -> Result<Outcome, MirrorError> {
        // Stage 3: fetch with retry.
        if let Err(err) = fetch::download_uri_to_file(&entry.source_uri, temp_path) {
            error!(
                source = %entry.source_uri,
                target = %temp_path.display(),
                error = %err,
                "error occurred while downloading the file"
            );
            output.errors.push(format!(
                "Error occurred while downloading the file URI {} to disk {}",
                entry.source_uri,
                temp_path.display()
            ));
            return Ok(Outcome::Skipped);
        }

        // Stage 4: expand a single-file archive.
        let mut local_file = temp_path.to_path_buf();
        if archive::is_archived(&entry.filename) {
            match archive::unpack(&local_file) {
                Ok(expanded) => {
                    guard.track(expanded.clone());
                    local_file = expanded;
                }
                Err(err) => {
                    error!(
                        archive = %local_file.display(),
                        error = %err,
                        "error occurred while expanding the archive"
                    );
                    output.errors.push(format!(
                        "Error occurred while expanding the archive for file URI {}",
                        entry.source_uri
                    ));
                    return Ok(Outcome::Skipped);
                }
            }
        }

        // Stage 5: integrity scan and metadata extraction.
        let mut tentative = match self.scanner.extract(
            &self.definition.id,
            &entry.dataset_id,
            dest_uri,
            &local_file,
            entry.last_modified,
        ) {
            Ok(metadata) => metadata,
            Err(err) => {
                error!(
                    file = %local_file.display(),
                    error = %err,
                    "can not generate metadata for the downloaded file"
                );
                output.warnings.push(format!(
                    "Can not generate metadata for file URI: {}",
                    entry.source_uri
                ));
                return Ok(Outcome::Skipped);
            }
        };
        tentative.last_downloaded = now_millis();

        // Stage 6: branch on the tentative status and checksum.
        if tentative.status != Status::Valid {
            self.persist_corrupted(tentative, &entry.source_uri, output)?;
            return Ok(Outcome::Skipped);
        }

        if let Some(old) = old {
            if tentative.checksum.is_some() && tentative.checksum == old.checksum {
                // The source advertised a newer date but the content did not
                // change. Record the new dates; the sink stays untouched.
                let mut updated = old.clone();
                updated.last_modified = entry.last_modified;
                updated.last_downloaded = tentative.last_downloaded;
                if updated.status == Status::Deleted {
                    // The destination object stays missing; a manual sink
                    // deletion is sticky while the content hash matches.
                    warn!(
                        id = %updated.id,
                        "content unchanged for a DELETED record, not restoring the file"
                    );
                }
                self.store.upsert(&updated)?;
                debug!(id = %updated.id, "content unchanged, metadata dates advanced");
                return Ok(Outcome::Skipped);
            }
        }

        // Content actually changed: run the expensive validation before
        // letting the file anywhere near the sink.
        match self.scanner.deep_scan(&local_file) {
            Ok(None) => {}
            Ok(Some(message)) => {
                let detailed = format!(
                    "The dataset file {} found at URL {} contains invalid / corrupted data: {}",
                    local_file.display(),
                    entry.source_uri,
                    message
                );
                error!("{detailed}");
                tentative.status = Status::Corrupted;
                tentative.error_message = Some(detailed.clone());
                self.store.upsert(&tentative)?;
                self.notifier.corrupted_file(&entry.source_uri, &detailed);
                output.warnings.push(detailed);
                return Ok(Outcome::Skipped);
            }
            Err(err) => {
                error!(
                    file = %local_file.display(),
                    error = %err,
                    "error occurred while scanning the dataset file"
                );
                tentative.status = Status::Corrupted;
                tentative.error_message = Some("Error occurred during data scan".to_string());
                tentative.stacktrace = vec![err.to_string()];
                self.store.upsert(&tentative)?;
                self.notifier
                    .corrupted_file(&entry.source_uri, &err.to_string());
                output.warnings.push(format!(
                    "Error occurred during data scan for file URI: {}",
                    entry.source_uri
                ));
                return Ok(Outcome::Skipped);
            }
        }

        // Publish, then persist. The metadata write only happens once the
        // object is visible at its destination.
        info!(source = %local_file.display(), destination = dest_uri, "publishing");
        if let Err(err) = self.sink.publish(&local_file, dest_uri) {
            error!(
                source = %local_file.display(),
                destination = dest_uri,
                error = %err,
                "error occurred while publishing the file"
            );
            output.errors.push(format!(
                "Error occurred while uploading the file URI {} to {}",
                entry.source_uri, dest_uri
            ));
            return Ok(Outcome::Skipped);
        }

        self.store.upsert(&tentative)?;
        output.success.push(tentative);
        Ok(Outcome::Downloaded)
    }

    fn persist_corrupted(
        &self,
        tentative: DatasetMetadata,
        source_uri: &str,
        output: &mut DownloadOutput,
    ) -> Result<(), MirrorError> {
        warn!(uri = source_uri, "the downloaded dataset file is corrupted");
        if let Some(message) = &tentative.error_message {
            error!("Error: {message}");
        }
        for line in &tentative.stacktrace {
            error!("    {line}");
        }
        self.store.upsert(&tentative)?;
        self.notifier.corrupted_file(
            source_uri,
            tentative
                .error_message
                .as_deref()
                .unwrap_or("metadata extraction failed"),
        );
        output.warnings.push(format!(
            "Metadata is invalid for file URI: {source_uri}"
        ));
        Ok(())
    }
}
