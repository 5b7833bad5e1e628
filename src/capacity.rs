use std::path::Path;

use sysinfo::Disks;

use crate::error::MirrorError;

/// Usable space on the filesystem holding `path`, resolved to the disk with
/// the longest matching mount point.
pub fn usable_space(path: &Path) -> Result<u64, MirrorError> {
    let canonical = path
        .canonicalize()
        .map_err(|err| MirrorError::SpaceProbe(format!("{}: {err}", path.display())))?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| MirrorError::SpaceProbe(path.display().to_string()))
}

pub fn to_megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
