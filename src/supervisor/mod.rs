pub mod classifier;
pub mod core;
pub mod error;
pub mod process;
pub mod server;
pub mod state_machine;
pub mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

pub use self::classifier::{OutputClassifier, OutputEvent, OutputKind};
pub use self::core::{ProcessSupervisor, ReadyCallback, SupervisorEvent, SupervisorSnapshot};
pub use self::error::SupervisorError;
pub use self::process::{LaunchSpec, LaunchedProcess, Liveness, ProcessHandle, ProcessLauncher, SystemLauncher};
pub use self::server::ServerSupervisor;
pub use self::state_machine::SupervisorState;
pub use self::tunnel::{TunnelEndpoint, TunnelSupervisor};

use crate::config::AppConfig;
use crate::console::ConsoleBuffer;

/// One server and one tunnel sharing a console feed.
pub struct Supervisor {
    pub server: Arc<ServerSupervisor>,
    pub tunnel: Arc<TunnelSupervisor>,
    pub console: Arc<ConsoleBuffer>,
    backup_dir: PathBuf,
}

impl Supervisor {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(config: &AppConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let console = Arc::new(ConsoleBuffer::new());
        let server = ServerSupervisor::from_config(config, launcher.clone(), console.clone())
            .on_ready(|| tracing::info!("Server reported ready"));
        let tunnel = TunnelSupervisor::new(config.tunnel.endpoint(), launcher, console.clone());
        tracing::info!(
            "Supervising '{}' and '{}'",
            server.command_line(),
            tunnel.endpoint().launch_spec().command_line()
        );
        Self {
            server: Arc::new(server),
            tunnel: Arc::new(tunnel),
            console,
            backup_dir: config.paths.backups.clone(),
        }
    }

    /// Backup directory from the configuration.
    pub fn backup_dir(&self) -> &PathBuf {
        &self.backup_dir
    }

    /// Stop both processes. Does not wait for them to exit.
    pub async fn shutdown(&self) {
        if self.tunnel.is_running() {
            self.tunnel.stop();
        }
        if self.server.is_running() {
            self.server.stop().await;
        }
    }
}
