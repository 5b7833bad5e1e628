use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MirrorError;

/// One reconciliation unit: catalogue sources, a filename selection rule and
/// a sink, as stored in the definition collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadDefinition {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "catalogueUrls")]
    pub catalogue_urls: Vec<CatalogueSource>,
    #[serde(default, rename = "filenameRegex", skip_serializing_if = "Option::is_none")]
    pub filename_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueSource {
    #[serde(rename = "catalogueUrl")]
    pub catalogue_url: String,
    #[serde(default, rename = "subDirectory", skip_serializing_if = "Option::is_none")]
    pub sub_directory: Option<String>,
    #[serde(default, rename = "filenameRegex", skip_serializing_if = "Option::is_none")]
    pub filename_regex: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    S3,
    #[serde(rename = "FILE")]
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "type")]
    pub output_type: OutputType,
    pub destination: String,
    #[serde(rename = "downloadDir")]
    pub download_dir: Utf8PathBuf,
}

impl Output {
    /// Final location for a dataset: destination prefix with trailing `/`
    /// enforced, then the source sub-directory if any, then the filename.
    pub fn destination_uri(&self, sub_directory: Option<&str>, filename: &str) -> String {
        let mut uri = self.destination.clone();
        if !uri.ends_with('/') {
            uri.push('/');
        }
        if let Some(sub_dir) = sub_directory {
            if !sub_dir.is_empty() {
                uri.push_str(sub_dir);
                uri.push('/');
            }
        }
        uri.push_str(filename);
        uri
    }

    /// Temporary download location for a dataset.
    pub fn download_path(&self, filename: &str) -> Utf8PathBuf {
        self.download_dir.join(filename)
    }
}

/// Filename selection rule, compiled once per run.
#[derive(Debug, Clone)]
pub enum FilenameFilter {
    Files(BTreeSet<String>),
    Regex(Regex),
    All,
}

impl FilenameFilter {
    pub fn admits(&self, filename: &str) -> bool {
        match self {
            FilenameFilter::Files(files) => files.contains(filename),
            FilenameFilter::Regex(regex) => regex.is_match(filename),
            FilenameFilter::All => true,
        }
    }
}

/// Anchor a pattern so that it must match the whole filename, as the
/// definition documents expect.
fn full_match_regex(definition_id: &str, pattern: &str) -> Result<Regex, MirrorError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|err| MirrorError::InvalidDefinition {
        id: definition_id.to_string(),
        message: format!("invalid filenameRegex {pattern:?}: {err}"),
    })
}

impl DownloadDefinition {
    /// The definition-level selection rule. An explicit file set wins over
    /// the regex; with neither, everything is admitted.
    pub fn filename_filter(&self) -> Result<FilenameFilter, MirrorError> {
        if let Some(files) = &self.files {
            if !files.is_empty() {
                return Ok(FilenameFilter::Files(files.iter().cloned().collect()));
            }
        }
        if let Some(pattern) = &self.filename_regex {
            return Ok(FilenameFilter::Regex(full_match_regex(&self.id, pattern)?));
        }
        Ok(FilenameFilter::All)
    }

    /// The rule for one catalogue source: a per-source regex overrides the
    /// definition-level rule.
    pub fn source_filter(&self, source: &CatalogueSource) -> Result<FilenameFilter, MirrorError> {
        if let Some(pattern) = &source.filename_regex {
            return Ok(FilenameFilter::Regex(full_match_regex(&self.id, pattern)?));
        }
        self.filename_filter()
    }

    /// Replace the selection rule with an explicit file list, used when the
    /// operator restricts a manual run to specific files.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = Some(files);
        self
    }
}

/// Directory-of-JSON-documents adapter for the definition collection.
///
/// One definition per `.json` file. A database-backed collection can stand
/// in behind the same surface.
#[derive(Debug, Clone)]
pub struct DefinitionStore {
    root: Utf8PathBuf,
}

impl DefinitionStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn read_all(&self) -> Result<Vec<DownloadDefinition>, MirrorError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut definitions = Vec::new();
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| MirrorError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            // One broken document must not take down the whole collection.
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable definition document"
                    );
                    continue;
                }
            };
            match serde_json::from_str::<DownloadDefinition>(&content) {
                Ok(definition) => definitions.push(definition),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping malformed definition document"
                    );
                }
            }
        }
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    /// Look up one definition by id, enabled or not.
    pub fn get(&self, id: &str) -> Result<Option<DownloadDefinition>, MirrorError> {
        Ok(self.read_all()?.into_iter().find(|def| def.id == id))
    }

    /// All enabled definitions, sorted by id.
    pub fn list_enabled(&self) -> Result<Vec<DownloadDefinition>, MirrorError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|def| def.enabled)
            .collect())
    }
}
