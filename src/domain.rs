use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Lifecycle of a mirrored dataset record.
///
/// DELETED and CORRUPTED act as tombstones: they suppress re-download until
/// the source's advertised last-modified strictly increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Valid,
    Corrupted,
    Deleted,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Valid => write!(f, "VALID"),
            Status::Corrupted => write!(f, "CORRUPTED"),
            Status::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Content hash tagged with its algorithm, rendered as `MD5:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Streaming MD5 over the exact bytes on disk.
    pub fn md5_of_file(path: &Path) -> Result<Self, MirrorError> {
        let mut file = File::open(path)
            .map_err(|err| MirrorError::Filesystem(format!("open {}: {err}", path.display())))?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 32 * 1024];
        loop {
            let read = file
                .read(&mut buf)
                .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        let digest = hasher.finalize();
        Ok(Self(format!("MD5:{digest:x}")))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Checksum {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.contains(':') {
            return Err(MirrorError::Scan(format!("invalid checksum: {value}")));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Replace every character outside the store's key alphabet with `_`.
///
/// The key alphabet is `[A-Za-z0-9_-]`. Notably a dot inside a dataset id
/// becomes `_`; records written before this rule existed carry raw dots in
/// their primary key and are never matched by the canonical lookup.
pub fn safe_id_value(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Canonical primary key for a mirrored dataset record.
pub fn unique_dataset_id(definition_id: &str, dataset_id: &str) -> String {
    format!("{definition_id}/{}", safe_id_value(dataset_id))
}

/// Wall-clock time in milliseconds since the epoch, UTC.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_id_replaces_invalid_characters() {
        assert_eq!(
            safe_id_value("downloads/gbr4_v2/gbr4_simple_2018-10.nc"),
            "downloads_gbr4_v2_gbr4_simple_2018-10_nc"
        );
        assert_eq!(safe_id_value("plain-id_01"), "plain-id_01");
    }

    #[test]
    fn unique_id_keeps_definition_id_verbatim() {
        assert_eq!(
            unique_dataset_id("downloads__gbr4", "gbr4_simple_2018-10.nc"),
            "downloads__gbr4/gbr4_simple_2018-10_nc"
        );
    }

    #[test]
    fn md5_of_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let checksum = Checksum::md5_of_file(&path).unwrap();
        assert_eq!(checksum.as_str(), "MD5:5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn status_serialises_uppercase() {
        assert_eq!(serde_json::to_string(&Status::Valid).unwrap(), "\"VALID\"");
        assert_eq!(
            serde_json::from_str::<Status>("\"DELETED\"").unwrap(),
            Status::Deleted
        );
    }
}
