use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{unique_dataset_id, Checksum, Status};
use crate::error::MirrorError;

/// The authoritative record for one mirrored file.
///
/// `_id` is the canonical primary key `definitionId + "/" +
/// safe_id_value(datasetId)`. Records written before key sanitisation carry a
/// differently spelled `_id`; they never match the canonical lookup and are
/// deliberately left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "definitionId")]
    pub definition_id: String,
    #[serde(rename = "datasetId")]
    pub dataset_id: String,
    #[serde(rename = "fileURI")]
    pub file_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    pub status: Status,
    #[serde(rename = "lastModified")]
    pub last_modified: i64,
    #[serde(rename = "lastDownloaded")]
    pub last_downloaded: i64,
    #[serde(default, rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<String>,
    /// Extracted scientific metadata. Opaque to the reconciliation engine.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub attributes: Value,
}

impl DatasetMetadata {
    pub fn new(
        definition_id: &str,
        dataset_id: &str,
        file_uri: &str,
        last_modified: i64,
    ) -> Self {
        Self {
            id: unique_dataset_id(definition_id, dataset_id),
            definition_id: definition_id.to_string(),
            dataset_id: dataset_id.to_string(),
            file_uri: file_uri.to_string(),
            checksum: None,
            status: Status::Valid,
            last_modified,
            last_downloaded: last_modified,
            error_message: None,
            stacktrace: Vec::new(),
            attributes: Value::Null,
        }
    }
}

/// Store adapter for the metadata index. The reconciliation loop reads a
/// definition's records once up front; writes go straight through.
pub trait MetadataStore {
    fn list(&self, definition_id: &str) -> Result<Vec<DatasetMetadata>, MirrorError>;
    fn upsert(&self, record: &DatasetMetadata) -> Result<(), MirrorError>;
    fn delete(&self, primary_key: &str) -> Result<(), MirrorError>;
}

/// Directory-of-JSON-documents implementation: one document per record,
/// grouped by definition, written atomically via a sibling temp file.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    root: Utf8PathBuf,
}

impl JsonMetadataStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn record_path(&self, primary_key: &str) -> Result<Utf8PathBuf, MirrorError> {
        let (definition_id, tail) = primary_key
            .split_once('/')
            .ok_or_else(|| MirrorError::Store(format!("malformed primary key {primary_key}")))?;
        Ok(self
            .root
            .join(definition_id)
            .join(format!("{tail}.json")))
    }
}

impl MetadataStore for JsonMetadataStore {
    fn list(&self, definition_id: &str) -> Result<Vec<DatasetMetadata>, MirrorError> {
        let dir = self.root.join(definition_id);
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| MirrorError::Store(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| MirrorError::Store(err.to_string()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            let content = fs::read_to_string(&path)
                .map_err(|err| MirrorError::Store(err.to_string()))?;
            let record: DatasetMetadata = serde_json::from_str(&content)
                .map_err(|err| MirrorError::Store(format!("{}: {err}", path.display())))?;
            if record.id != unique_dataset_id(&record.definition_id, &record.dataset_id) {
                debug!(id = %record.id, "record carries a non-canonical primary key");
            }
            records.push(record);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn upsert(&self, record: &DatasetMetadata) -> Result<(), MirrorError> {
        let path = self.record_path(&record.id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| MirrorError::Store(err.to_string()))?;
        }
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| MirrorError::Store(err.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| MirrorError::Store(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| MirrorError::Store(err.to_string()))?;
        Ok(())
    }

    fn delete(&self, primary_key: &str) -> Result<(), MirrorError> {
        let path = self.record_path(primary_key)?;
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| MirrorError::Store(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JsonMetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("metadata")).unwrap();
        (dir, JsonMetadataStore::new(root))
    }

    #[test]
    fn upsert_then_list_round_trips() {
        let (_dir, store) = store();
        let mut record = DatasetMetadata::new(
            "downloads__gbr4",
            "fx3/gbr4_v2/gbr4_simple_2018-10.nc",
            "s3://bucket/gbr4/gbr4_simple_2018-10.nc",
            1541422570000,
        );
        record.checksum = Some("MD5:b16fa142ee09acd1ddb9d06f49d0d21a".parse().unwrap());
        record.last_downloaded = 1541422580000;
        store.upsert(&record).unwrap();

        let listed = store.list("downloads__gbr4").unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[test]
    fn upsert_overwrites_by_primary_key() {
        let (_dir, store) = store();
        let mut record = DatasetMetadata::new("def", "a.nc", "file:///mirror/a.nc", 1000);
        store.upsert(&record).unwrap();
        record.status = Status::Deleted;
        store.upsert(&record).unwrap();

        let listed = store.list("def").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, Status::Deleted);
    }

    #[test]
    fn delete_removes_the_document() {
        let (_dir, store) = store();
        let record = DatasetMetadata::new("def", "a.nc", "file:///mirror/a.nc", 1000);
        store.upsert(&record).unwrap();
        store.delete(&record.id).unwrap();
        assert!(store.list("def").unwrap().is_empty());
    }

    #[test]
    fn json_field_names_match_the_document_contract() {
        let record = DatasetMetadata::new("def", "a.nc", "file:///mirror/a.nc", 1000);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["_id"], "def/a_nc");
        assert_eq!(json["definitionId"], "def");
        assert_eq!(json["datasetId"], "a.nc");
        assert_eq!(json["fileURI"], "file:///mirror/a.nc");
        assert_eq!(json["status"], "VALID");
        assert_eq!(json["lastModified"], 1000);
    }

    #[test]
    fn list_keeps_legacy_records_readable() {
        let (_dir, store) = store();
        // Hand-written legacy document with an unsanitised key.
        let legacy_dir = store.root().join("def");
        fs::create_dir_all(legacy_dir.as_std_path()).unwrap();
        let legacy = serde_json::json!({
            "_id": "def/a.nc",
            "definitionId": "def",
            "datasetId": "a.nc",
            "fileURI": "file:///mirror/a.nc",
            "status": "VALID",
            "lastModified": 1000,
            "lastDownloaded": 1000,
        });
        fs::write(
            legacy_dir.join("a.nc.json").as_std_path(),
            serde_json::to_vec_pretty(&legacy).unwrap(),
        )
        .unwrap();

        let listed = store.list("def").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "def/a.nc");
    }
}
