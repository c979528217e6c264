//! Data directory archives, produced and read by the host's `tar`.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use avanode_supervisor::{run_checked, CommandError};
use tracing::info;

pub const DATA_ARCHIVE: &str = "data.tar.gz";

/// Below this an archive is suspicious, though a fresh node may legitimately
/// be this small.
pub const MIN_PLAUSIBLE_ARCHIVE_BYTES: u64 = 1024 * 1024;

/// Default bound on one tar run; a full node database runs to hundreds of GB
pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

const TAR: &str = "tar";

pub async fn create_archive(
    source_dir: &Path,
    dest: &Path,
    timeout: Duration,
) -> Result<(), CommandError> {
    info!("Archiving {} to {}", source_dir.display(), dest.display());
    let args = [
        OsStr::new("-czf"),
        dest.as_os_str(),
        OsStr::new("-C"),
        source_dir.as_os_str(),
        OsStr::new("."),
    ];
    run_checked(TAR, &args, Some(timeout)).await.map(|_| ())
}

/// Number of entries, or an error if the archive cannot be read end to end.
pub async fn list_archive(archive: &Path, timeout: Duration) -> Result<usize, CommandError> {
    let args = [OsStr::new("-tzf"), archive.as_os_str()];
    let output = run_checked(TAR, &args, Some(timeout)).await?;
    Ok(output.stdout.lines().filter(|l| !l.trim().is_empty()).count())
}

pub async fn extract_archive(
    archive: &Path,
    dest_dir: &Path,
    timeout: Duration,
) -> Result<(), CommandError> {
    info!("Extracting {} into {}", archive.display(), dest_dir.display());
    let args = [
        OsStr::new("-xzf"),
        archive.as_os_str(),
        OsStr::new("-C"),
        dest_dir.as_os_str(),
    ];
    run_checked(TAR, &args, Some(timeout)).await.map(|_| ())
}
