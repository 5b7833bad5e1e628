use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::MirrorError;

/// Single-file archive extensions recognised in catalogue filenames.
const ARCHIVE_EXTENSIONS: [&str; 2] = [".zip", ".gz"];

pub fn is_archived(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// The filename the expanded file will carry: the archive extension dropped.
pub fn unpacked_filename(filename: &str) -> &str {
    let lower = filename.to_ascii_lowercase();
    for ext in ARCHIVE_EXTENSIONS {
        if lower.ends_with(ext) {
            return &filename[..filename.len() - ext.len()];
        }
    }
    filename
}

/// Expand a single-file archive to a sibling file, delete the archive and
/// return the expanded path.
pub fn unpack(archive_path: &Path) -> Result<PathBuf, MirrorError> {
    let filename = archive_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            MirrorError::Filesystem(format!("invalid archive path {}", archive_path.display()))
        })?;
    let target = archive_path.with_file_name(unpacked_filename(filename));

    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        unpack_zip(archive_path, &target)?;
    } else if lower.ends_with(".gz") {
        unpack_gz(archive_path, &target)?;
    } else {
        return Ok(archive_path.to_path_buf());
    }

    fs::remove_file(archive_path).map_err(|err| {
        MirrorError::Filesystem(format!("delete archive {}: {err}", archive_path.display()))
    })?;
    Ok(target)
}

fn unpack_zip(archive_path: &Path, target: &Path) -> Result<(), MirrorError> {
    let file = File::open(archive_path)
        .map_err(|err| MirrorError::Filesystem(format!("open zip {}: {err}", archive_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| MirrorError::Filesystem(err.to_string()))?;

    let mut entry = None;
    for index in 0..archive.len() {
        let candidate = archive
            .by_index(index)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        if !candidate.is_dir() {
            entry = Some(index);
            break;
        }
    }
    let index = entry.ok_or_else(|| {
        MirrorError::Filesystem(format!(
            "zip archive {} contains no file entry",
            archive_path.display()
        ))
    })?;

    let mut entry = archive
        .by_index(index)
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    let mut out =
        File::create(target).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    io::copy(&mut entry, &mut out).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    Ok(())
}

fn unpack_gz(archive_path: &Path, target: &Path) -> Result<(), MirrorError> {
    let file = File::open(archive_path)
        .map_err(|err| MirrorError::Filesystem(format!("open gz {}: {err}", archive_path.display())))?;
    let mut decoder = GzDecoder::new(file);
    let mut out =
        File::create(target).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, &mut out).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    Ok(())
}
