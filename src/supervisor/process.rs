//! Process launch primitive: spawn a command, hand back a handle for liveness
//! and termination, and a single channel carrying stdout and stderr lines.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::error::SupervisorError;

/// Capacity of the merged output channel. Readers wait when it is full,
/// which throttles the child instead of dropping lines.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// What to run and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line for log messages.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| crate::utils::display_arg(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Exit code, when the platform reports one.
    Exited(Option<i32>),
}

/// Exclusive reference to a launched OS process.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn liveness(&mut self) -> Liveness;

    /// Ask the process to exit. Does not wait for it.
    fn terminate(&mut self) -> Result<(), SupervisorError>;

    fn is_alive(&mut self) -> bool {
        self.liveness() == Liveness::Alive
    }
}

pub struct LaunchedProcess {
    pub handle: Box<dyn ProcessHandle>,
    /// Combined stdout/stderr, one item per line. Closes when both streams end.
    pub output: mpsc::Receiver<String>,
}

pub trait ProcessLauncher: Send + Sync {
    /// Must be called from within a tokio runtime.
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, SupervisorError>;
}

/// Launches real OS processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, SupervisorError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::LaunchFailure {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!("Launched '{}' (pid: {:?})", spec.command_line(), pid);

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        Ok(LaunchedProcess {
            handle: Box::new(ChildHandle {
                child,
                pid,
                exit: None,
            }),
            output: rx,
        })
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

struct ChildHandle {
    child: Child,
    pid: Option<u32>,
    exit: Option<Option<i32>>,
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn liveness(&mut self) -> Liveness {
        if let Some(code) = self.exit {
            return Liveness::Exited(code);
        }
        match self.child.try_wait() {
            Ok(None) => Liveness::Alive,
            Ok(Some(status)) => {
                self.exit = Some(status.code());
                Liveness::Exited(status.code())
            }
            Err(e) => {
                tracing::warn!("Failed to poll process {:?}: {}", self.pid, e);
                self.exit = Some(None);
                Liveness::Exited(None)
            }
        }
    }

    fn terminate(&mut self) -> Result<(), SupervisorError> {
        if !self.is_alive() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = self
                .pid
                .ok_or_else(|| SupervisorError::SignalFailure("process has no pid".into()))?;
            tracing::info!("Sending TERM signal to pid {}", pid);
            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| SupervisorError::SignalFailure(format!("failed to send SIGTERM: {}", e)))
        }

        #[cfg(not(unix))]
        {
            tracing::info!("Terminating pid {:?}", self.pid);
            self.child
                .start_kill()
                .map_err(|e| SupervisorError::SignalFailure(e.to_string()))
        }
    }
}
