//! Snapshot a directory into a timestamped zip archive.
//!
//! The archive is written to `<dest>.zip.partial` and renamed into place only
//! after the zip footer is flushed, so a failed run never leaves something
//! that looks like a finished backup.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Sortable, filesystem-safe timestamp format used in archive names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const ARCHIVE_EXTENSION: &str = "zip";

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive already exists: {0:?}")]
    DestinationExists(PathBuf),

    #[error("not a directory: {0:?}")]
    NotADirectory(PathBuf),
}

impl ArchiveError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of one archive run. Only ever logged; the file on disk is the record.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    pub source_dir: PathBuf,
    pub destination_path: PathBuf,
    pub timestamp: DateTime<Local>,
}

/// Produces a compressed archive of a directory.
pub trait ArchiveService: Send + Sync {
    /// Archive `source_dir` to `dest_without_ext` plus the service's extension
    /// and return the full archive path. Never touches `source_dir`.
    fn archive(&self, source_dir: &Path, dest_without_ext: &Path) -> Result<PathBuf, ArchiveError>;

    fn extension(&self) -> &str;
}

#[derive(Debug, Clone, Copy)]
pub struct ZipArchiver {
    compression: CompressionMethod,
}

impl Default for ZipArchiver {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Deflated,
        }
    }
}

impl ZipArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored() -> Self {
        Self {
            compression: CompressionMethod::Stored,
        }
    }

    fn write_archive(&self, source_dir: &Path, partial: &Path) -> Result<(), ArchiveError> {
        let file = File::create(partial).map_err(ArchiveError::io(partial))?;
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(self.compression);

        add_dir_entries(&mut writer, source_dir, source_dir, options)?;

        let file = writer.finish()?;
        file.sync_all().map_err(ArchiveError::io(partial))?;
        Ok(())
    }
}

impl ArchiveService for ZipArchiver {
    fn archive(&self, source_dir: &Path, dest_without_ext: &Path) -> Result<PathBuf, ArchiveError> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::NotADirectory(source_dir.to_path_buf()));
        }

        let dest = with_extension(dest_without_ext, ARCHIVE_EXTENSION);
        if dest.exists() {
            return Err(ArchiveError::DestinationExists(dest));
        }
        let partial = with_extension(dest_without_ext, "zip.partial");

        if let Err(e) = self.write_archive(source_dir, &partial) {
            if let Err(cleanup) = fs::remove_file(&partial) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial archive {:?}: {}", partial, cleanup);
                }
            }
            return Err(e);
        }

        fs::rename(&partial, &dest).map_err(ArchiveError::io(&dest))?;
        Ok(dest)
    }

    fn extension(&self) -> &str {
        ARCHIVE_EXTENSION
    }
}

/// Recursively add everything under `dir`, with entry names relative to `root`.
fn add_dir_entries(
    writer: &mut ZipWriter<File>,
    root: &Path,
    dir: &Path,
    options: FileOptions,
) -> Result<(), ArchiveError> {
    let mut entries = fs::read_dir(dir)
        .map_err(ArchiveError::io(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(ArchiveError::io(dir))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry_name(root, &path);

        if path.is_dir() {
            writer.add_directory(name.as_str(), options)?;
            add_dir_entries(writer, root, &path, options)?;
        } else {
            writer.start_file(name.as_str(), options)?;
            let mut src = File::open(&path).map_err(ArchiveError::io(&path))?;
            io::copy(&mut src, writer).map_err(ArchiveError::io(&path))?;
        }
    }
    Ok(())
}

fn entry_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn with_extension(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

pub fn timestamp_slug(ts: &DateTime<Local>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// `<backup_dir>/<prefix>_<timestamp>`, with `_2`, `_3`, ... appended when an
/// archive of that name already exists so earlier backups are never replaced.
pub fn archive_base(backup_dir: &Path, prefix: &str, ts: &DateTime<Local>, ext: &str) -> PathBuf {
    let stem = format!("{}_{}", prefix, timestamp_slug(ts));
    let mut base = backup_dir.join(&stem);
    let mut n = 2;
    while with_extension(&base, ext).exists() {
        base = backup_dir.join(format!("{}_{}", stem, n));
        n += 1;
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Read;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("region")).unwrap();
        fs::write(dir.join("level.dat"), b"level").unwrap();
        fs::write(dir.join("region").join("r.0.0.mca"), b"chunks").unwrap();
    }

    #[test]
    fn archives_nested_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let world = tmp.path().join("world");
        populate(&world);

        let dest = ZipArchiver::new()
            .archive(&world, &tmp.path().join("world_backup"))
            .unwrap();
        assert_eq!(dest, tmp.path().join("world_backup.zip"));
        assert!(world.exists(), "source must be left alone");

        let mut zip = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut content = String::new();
        zip.by_name("region/r.0.0.mca")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "chunks");
        assert!(zip.by_name("level.dat").is_ok());
    }

    #[test]
    fn missing_source_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ZipArchiver::new()
            .archive(&tmp.path().join("nope"), &tmp.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotADirectory(_)));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let world = tmp.path().join("world");
        populate(&world);
        fs::write(tmp.path().join("out.zip"), b"older backup").unwrap();

        let err = ZipArchiver::stored()
            .archive(&world, &tmp.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::DestinationExists(_)));
        assert_eq!(fs::read(tmp.path().join("out.zip")).unwrap(), b"older backup");
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_removes_partial() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let world = tmp.path().join("world");
        populate(&world);
        let locked = world.join("session.lock");
        fs::write(&locked, b"lock").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if File::open(&locked).is_ok() {
            // running as root; permissions are not enforced
            return;
        }

        let backups = tmp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let err = ZipArchiver::new()
            .archive(&world, &backups.join("world"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 0);
    }

    #[test]
    fn archive_names_sort_by_time() {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(timestamp_slug(&ts), "2024-03-09_07-05-01");

        let tmp = tempfile::tempdir().unwrap();
        let base = archive_base(tmp.path(), "world", &ts, "zip");
        assert_eq!(base, tmp.path().join("world_2024-03-09_07-05-01"));
    }

    #[test]
    fn same_second_gets_suffix() {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("world_2024-03-09_07-05-01.zip"), b"x").unwrap();
        fs::write(tmp.path().join("world_2024-03-09_07-05-01_2.zip"), b"x").unwrap();

        let base = archive_base(tmp.path(), "world", &ts, "zip");
        assert_eq!(base, tmp.path().join("world_2024-03-09_07-05-01_3"));
    }
}
