//! Persisted settings. Read once at startup; the supervisors treat every
//! value as an immutable construction parameter.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::supervisor::classifier::MINECRAFT_LOG_PATTERN;
use crate::supervisor::{LaunchSpec, OutputClassifier, SupervisorError, TunnelEndpoint};

pub const DEFAULT_CONFIG_PATH: &str = "mcwarden.toml";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TunnelConfig {
    pub program: String,
    pub user: String,
    pub host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub extra_args: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            user: String::new(),
            host: String::new(),
            local_port: 25565,
            remote_port: 25565,
            extra_args: vec!["-o".to_string(), "ExitOnForwardFailure=yes".to_string()],
        }
    }
}

impl TunnelConfig {
    pub fn endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint {
            program: self.program.clone(),
            user: self.user.clone(),
            host: self.host.clone(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            extra_args: self.extra_args.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub java: String,
    /// Jar path relative to `paths.server_files`, or absolute.
    pub jar_file: String,
    pub mem_opts: String,
    pub extra_args: Vec<String>,
    /// Every marker must appear on one line for the server to count as ready.
    pub ready_markers: Vec<String>,
    pub started_markers: Vec<String>,
    pub stopped_markers: Vec<String>,
    pub log_pattern: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            java: "java".to_string(),
            jar_file: "paper.jar".to_string(),
            mem_opts: "-Xms512M -Xmx2G".to_string(),
            extra_args: vec!["--nogui".to_string()],
            ready_markers: vec!["Done (".to_string(), "For help, type \"help\"".to_string()],
            started_markers: Vec::new(),
            stopped_markers: vec!["All dimensions are saved".to_string()],
            log_pattern: Some(MINECRAFT_LOG_PATTERN.to_string()),
        }
    }
}

impl ServerConfig {
    /// `java <mem_opts...> -jar <jar_file> <extra_args...>` run in `root`, so a
    /// relative jar path resolves against the server directory.
    pub fn launch_spec(&self, server_root: &Path) -> LaunchSpec {
        LaunchSpec::new(&self.java)
            .args(self.mem_opts.split_whitespace())
            .arg("-jar")
            .arg(&self.jar_file)
            .args(self.extra_args.iter().cloned())
            .current_dir(server_root)
    }

    pub fn classifier(&self) -> OutputClassifier {
        OutputClassifier::new()
            .with_ready_markers(self.ready_markers.iter().cloned())
            .with_started_markers(self.started_markers.iter().cloned())
            .with_stopped_markers(self.stopped_markers.iter().cloned())
            .with_level_pattern(self.log_pattern.as_deref())
    }

    pub fn memory(&self) -> Result<MemoryOptions, SupervisorError> {
        MemoryOptions::parse(&self.mem_opts)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub server_files: PathBuf,
    pub backups: PathBuf,
    /// World folder inside `server_files` that "new world" archives.
    pub data_subdir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            server_files: PathBuf::from("server_files"),
            backups: PathBuf::from("world_backups"),
            data_subdir: "world".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
    pub poll_interval_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:57475".to_string(),
            poll_interval_ms: 500,
            restart_delay_ms: 2000,
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// JVM heap bounds in megabytes, as in `-Xms512M -Xmx2048M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOptions {
    pub min_mb: u32,
    pub max_mb: u32,
}

impl MemoryOptions {
    pub fn from_megabytes(min_mb: u32, max_mb: u32) -> Result<Self, SupervisorError> {
        if min_mb > max_mb {
            return Err(SupervisorError::InvalidConfig(format!(
                "minimum memory ({} MB) is larger than maximum ({} MB)",
                min_mb, max_mb
            )));
        }
        Ok(Self { min_mb, max_mb })
    }

    /// Parse `-Xms`/`-Xmx` flags with `M` or `G` suffixes.
    pub fn parse(mem_opts: &str) -> Result<Self, SupervisorError> {
        let mut min = None;
        let mut max = None;
        for flag in mem_opts.split_whitespace() {
            if let Some(value) = flag.strip_prefix("-Xms") {
                min = Some(parse_megabytes(value)?);
            } else if let Some(value) = flag.strip_prefix("-Xmx") {
                max = Some(parse_megabytes(value)?);
            }
        }
        match (min, max) {
            (Some(min), Some(max)) => Self::from_megabytes(min, max),
            _ => Err(SupervisorError::InvalidConfig(format!(
                "mem_opts '{}' must contain both -Xms and -Xmx",
                mem_opts
            ))),
        }
    }

    pub fn to_opts(self) -> String {
        format!("-Xms{}M -Xmx{}M", self.min_mb, self.max_mb)
    }
}

fn parse_megabytes(value: &str) -> Result<u32, SupervisorError> {
    let invalid = || SupervisorError::InvalidConfig(format!("invalid memory size '{}'", value));
    let upper = value.to_ascii_uppercase();
    let (digits, factor) = if let Some(d) = upper.strip_suffix('G') {
        (d, 1024)
    } else if let Some(d) = upper.strip_suffix('M') {
        (d, 1)
    } else {
        return Err(invalid());
    };
    digits
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_mul(factor))
        .ok_or_else(invalid)
}

impl AppConfig {
    /// Path from `MCWARDEN_CONFIG`, or `mcwarden.toml` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var("MCWARDEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Read the config, creating it with defaults when the file is missing.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.save(path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
            return Ok(cfg);
        }
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&s).with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let s = toml::to_string_pretty(self)?;
        fs::write(path, s).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `SSH_USER`, `SSH_HOST`, `LOCAL_PORT`, `REMOTE_PORT`, `JAR_FILE`,
    /// `MEM_OPTS`, `WORLD_DIR` and `ARCHIVE_DIR` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), SupervisorError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SupervisorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SSH_USER") {
            self.tunnel.user = v;
        }
        if let Some(v) = lookup("SSH_HOST") {
            self.tunnel.host = v;
        }
        if let Some(v) = lookup("LOCAL_PORT") {
            self.tunnel.local_port = parse_port("LOCAL_PORT", &v)?;
        }
        if let Some(v) = lookup("REMOTE_PORT") {
            self.tunnel.remote_port = parse_port("REMOTE_PORT", &v)?;
        }
        if let Some(v) = lookup("JAR_FILE") {
            self.server.jar_file = v;
        }
        if let Some(v) = lookup("MEM_OPTS") {
            self.server.mem_opts = v;
        }
        if let Some(v) = lookup("WORLD_DIR") {
            self.paths.data_subdir = v;
        }
        if let Some(v) = lookup("ARCHIVE_DIR") {
            self.paths.backups = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        self.server.memory()?;
        if self.paths.data_subdir.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig("paths.data_subdir is empty".into()));
        }
        if self.server.jar_file.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig("server.jar_file is empty".into()));
        }
        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, SupervisorError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| SupervisorError::InvalidConfig(format!("{} must be a port number, got '{}'", key, value)))
}
