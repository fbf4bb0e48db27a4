//! Game server supervision: readiness detection, restart and the
//! archive-then-delete "new world" operation.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;

use super::classifier::{OutputClassifier, OutputKind};
use super::core::{ProcessSupervisor, ReadyCallback, SupervisorEvent, SupervisorSnapshot};
use super::error::SupervisorError;
use super::process::{LaunchSpec, ProcessLauncher};
use super::state_machine::SupervisorState;
use crate::archive::{archive_base, ArchiveError, ArchiveRecord, ArchiveService, ZipArchiver};
use crate::config::AppConfig;
use crate::console::{ConsoleSink, Origin};

pub const DEFAULT_DATA_SUBDIR: &str = "world";
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(2);

pub struct ServerSupervisor {
    core: Arc<ProcessSupervisor>,
    server_root: PathBuf,
    data_subdir: String,
    restart_delay: Duration,
    archiver: Arc<dyn ArchiveService>,
    /// Serialises start/stop/restart; restart holds it for its whole sequence.
    commands: tokio::sync::Mutex<()>,
}

impl ServerSupervisor {
    pub fn new(
        spec: LaunchSpec,
        classifier: OutputClassifier,
        server_root: impl Into<PathBuf>,
        launcher: Arc<dyn ProcessLauncher>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        let core = ProcessSupervisor::new("Server", Origin::Server, spec, classifier, launcher, console)
            .with_launch_notice("Starting server...");
        Self {
            core: Arc::new(core),
            server_root: server_root.into(),
            data_subdir: DEFAULT_DATA_SUBDIR.to_string(),
            restart_delay: DEFAULT_RESTART_DELAY,
            archiver: Arc::new(ZipArchiver::new()),
            commands: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        launcher: Arc<dyn ProcessLauncher>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        let root = config.paths.server_files.clone();
        Self::new(
            config.server.launch_spec(&root),
            config.server.classifier(),
            root,
            launcher,
            console,
        )
        .with_data_subdir(config.paths.data_subdir.clone())
        .with_restart_delay(config.daemon.restart_delay())
    }

    pub fn with_data_subdir(mut self, subdir: impl Into<String>) -> Self {
        self.data_subdir = subdir.into();
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn ArchiveService>) -> Self {
        self.archiver = archiver;
        self
    }

    /// Register the readiness callback. Fires at most once per run.
    pub fn on_ready<F>(self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: ReadyCallback = Arc::new(callback);
        self.core.set_ready_callback(callback);
        self
    }

    pub async fn start(&self) {
        let _guard = self.commands.lock().await;
        self.core.start();
    }

    pub async fn stop(&self) {
        let _guard = self.commands.lock().await;
        self.core.stop();
    }

    /// stop, settle, start. Concurrent commands queue behind the whole sequence.
    pub async fn restart(&self) {
        let _guard = self.commands.lock().await;
        self.core.notice(OutputKind::RawLine, "Restarting server...");
        self.core.stop();
        tokio::time::sleep(self.restart_delay).await;
        self.core.start();
    }

    /// Archive the world directory into `backup_dir`, delete it, then start
    /// the server. The server is started on every path, including failures.
    ///
    /// This does not stop the server first: callers that need a consistent
    /// snapshot must stop it and wait for `Idle` beforehand.
    pub async fn replace_data_and_restart(
        &self,
        backup_dir: &Path,
    ) -> Result<Option<ArchiveRecord>, SupervisorError> {
        let outcome = self.archive_data_dir(backup_dir).await;
        match &outcome {
            Ok(Some(record)) => self.core.notice(
                OutputKind::RawLine,
                format!("World archived to {}", record.destination_path.display()),
            ),
            Ok(None) => self.core.notice(
                OutputKind::RawLine,
                format!("World folder not found at {}.", self.data_dir().display()),
            ),
            Err(e) => self.core.notice(
                OutputKind::ErrorMarker,
                format!("World was not replaced: {}", e),
            ),
        }
        self.start().await;
        outcome
    }

    async fn archive_data_dir(&self, backup_dir: &Path) -> Result<Option<ArchiveRecord>, SupervisorError> {
        self.validate_backup_dir(backup_dir)?;
        let data_dir = self.data_dir();
        if !data_dir.is_dir() {
            return Ok(None);
        }

        let archiver = Arc::clone(&self.archiver);
        let backup_dir = backup_dir.to_path_buf();
        let prefix = self.data_subdir.clone();
        // archive + delete are blocking filesystem work
        tokio::task::spawn_blocking(move || {
            archive_then_remove(archiver.as_ref(), &data_dir, &backup_dir, &prefix).map(Some)
        })
        .await
        .map_err(|e| SupervisorError::Internal(anyhow::anyhow!("archive task failed: {}", e)))?
    }

    /// Reject backup locations that would be deleted along with the world.
    pub fn validate_backup_dir(&self, backup_dir: &Path) -> Result<(), SupervisorError> {
        if backup_dir.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidConfig("backup directory is empty".into()));
        }
        let data_dir = lexical_absolute(&self.data_dir());
        if lexical_absolute(backup_dir).starts_with(&data_dir) {
            return Err(SupervisorError::InvalidConfig(format!(
                "backup directory {} is inside the world directory {}",
                backup_dir.display(),
                data_dir.display()
            )));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server_root.join(&self.data_subdir)
    }

    pub fn server_root(&self) -> &Path {
        &self.server_root
    }

    pub fn command_line(&self) -> String {
        self.core.spec().command_line()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn is_ready(&self) -> bool {
        self.core.state() == SupervisorState::Ready
    }

    pub fn state(&self) -> SupervisorState {
        self.core.state()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.core.snapshot()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SupervisorEvent> {
        self.core.subscribe()
    }
}

/// Archive must succeed before anything is deleted.
fn archive_then_remove(
    archiver: &dyn ArchiveService,
    data_dir: &Path,
    backup_dir: &Path,
    prefix: &str,
) -> Result<ArchiveRecord, SupervisorError> {
    fs::create_dir_all(backup_dir).map_err(|source| ArchiveError::Io {
        path: backup_dir.to_path_buf(),
        source,
    })?;

    let timestamp = Local::now();
    let base = archive_base(backup_dir, prefix, &timestamp, archiver.extension());
    let destination_path = archiver.archive(data_dir, &base)?;
    tracing::info!("Archived {:?} to {:?}", data_dir, destination_path);

    fs::remove_dir_all(data_dir).map_err(|source| ArchiveError::Io {
        path: data_dir.to_path_buf(),
        source,
    })?;

    Ok(ArchiveRecord {
        source_dir: data_dir.to_path_buf(),
        destination_path,
        timestamp,
    })
}

/// Absolute path with `.` and `..` folded, without touching the filesystem.
fn lexical_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SystemLauncher;

    fn supervisor(root: &Path) -> ServerSupervisor {
        ServerSupervisor::new(
            LaunchSpec::new("java"),
            OutputClassifier::minecraft(),
            root,
            Arc::new(SystemLauncher),
            Arc::new(crate::console::ConsoleBuffer::new()),
        )
    }

    #[test]
    fn data_dir_is_fixed_subpath() {
        let sup = supervisor(Path::new("server_files"));
        assert_eq!(sup.data_dir(), PathBuf::from("server_files/world"));
        let sup = sup.with_data_subdir("survival");
        assert_eq!(sup.data_dir(), PathBuf::from("server_files/survival"));
    }

    #[test]
    fn backup_dir_inside_world_is_rejected() {
        let sup = supervisor(Path::new("/srv/mc"));
        assert!(sup.validate_backup_dir(Path::new("/srv/mc/world/backups")).is_err());
        assert!(sup.validate_backup_dir(Path::new("/srv/mc/world/../world/x")).is_err());
        assert!(sup.validate_backup_dir(Path::new("")).is_err());
        assert!(sup.validate_backup_dir(Path::new("/srv/mc/world_backups")).is_ok());
        assert!(sup.validate_backup_dir(Path::new("/srv/backups")).is_ok());
    }

    #[test]
    fn archive_failure_keeps_data() {
        struct Broken;
        impl ArchiveService for Broken {
            fn archive(&self, _: &Path, dest: &Path) -> Result<PathBuf, ArchiveError> {
                Err(ArchiveError::Io {
                    path: dest.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                })
            }
            fn extension(&self) -> &str {
                "zip"
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let world = tmp.path().join("world");
        fs::create_dir_all(&world).unwrap();
        fs::write(world.join("level.dat"), b"x").unwrap();

        let err = archive_then_remove(&Broken, &world, &tmp.path().join("backups"), "world").unwrap_err();
        assert!(matches!(err, SupervisorError::ArchiveFailure(_)));
        assert!(world.join("level.dat").exists());
    }

    #[test]
    fn archive_then_remove_deletes_source() {
        let tmp = tempfile::tempdir().unwrap();
        let world = tmp.path().join("world");
        fs::create_dir_all(world.join("region")).unwrap();
        fs::write(world.join("region/r.0.0.mca"), b"x").unwrap();
        let backups = tmp.path().join("backups");

        let record = archive_then_remove(&ZipArchiver::new(), &world, &backups, "world").unwrap();
        assert!(!world.exists());
        assert!(record.destination_path.starts_with(&backups));
        assert!(record.destination_path.exists());
        let name = record.destination_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("world_"));
        assert!(name.ends_with(".zip"));
    }
}
