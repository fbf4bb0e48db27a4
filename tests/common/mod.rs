//! In-memory launcher for driving supervisors without real processes.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use mcwarden::console::ConsoleBuffer;
use mcwarden::supervisor::{
    LaunchSpec, LaunchedProcess, Liveness, OutputClassifier, ProcessHandle, ProcessLauncher,
    ServerSupervisor, SupervisorError, TunnelEndpoint, TunnelSupervisor,
};

pub const DONE_LINE: &str = "[12:00:05] [Server thread/INFO]: Done (5.123s)! For help, type \"help\"";
pub const SAVED_LINE: &str = "[12:10:00] [Server thread/INFO]: ThreadedAnvilChunkStorage: All dimensions are saved";

/// Test-side control over one fake process.
#[derive(Clone)]
pub struct FakeProcess {
    alive: Arc<AtomicBool>,
    output: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    pub spec: LaunchSpec,
}

impl FakeProcess {
    /// Print a line as if the process wrote it.
    pub fn emit(&self, line: &str) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            tx.try_send(line.to_string()).unwrap();
        }
    }

    /// Exit on its own: output closes and liveness reports the exit.
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.output.lock().unwrap().take();
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct FakeHandle {
    pid: u32,
    process: FakeProcess,
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn liveness(&mut self) -> Liveness {
        if self.process.is_alive() {
            Liveness::Alive
        } else {
            Liveness::Exited(Some(0))
        }
    }

    fn terminate(&mut self) -> Result<(), SupervisorError> {
        self.process.exit();
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedLauncher {
    launches: AtomicUsize,
    next_pid: AtomicU32,
    fail: AtomicBool,
    /// Lines every new process prints straight away.
    script: Mutex<Vec<String>>,
    processes: Mutex<Vec<FakeProcess>>,
}

impl ScriptedLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(lines: &[&str]) -> Arc<Self> {
        let launcher = Self::default();
        *launcher.script.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
        Arc::new(launcher)
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<FakeProcess> {
        self.processes.lock().unwrap().last().cloned()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, SupervisorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SupervisorError::LaunchFailure {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            });
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(1024);
        for line in self.script.lock().unwrap().iter() {
            let _ = tx.try_send(line.clone());
        }
        let process = FakeProcess {
            alive: Arc::new(AtomicBool::new(true)),
            output: Arc::new(Mutex::new(Some(tx))),
            spec: spec.clone(),
        };
        self.processes.lock().unwrap().push(process.clone());

        Ok(LaunchedProcess {
            handle: Box::new(FakeHandle {
                pid: 4000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
                process,
            }),
            output: rx,
        })
    }
}

pub fn server(root: &Path, launcher: Arc<ScriptedLauncher>, console: Arc<ConsoleBuffer>) -> ServerSupervisor {
    ServerSupervisor::new(
        LaunchSpec::new("java").args(["-Xms512M", "-Xmx2G", "-jar", "paper.jar", "--nogui"]),
        OutputClassifier::minecraft(),
        root,
        launcher,
        console,
    )
    .with_restart_delay(Duration::from_millis(20))
}

pub fn tunnel(launcher: Arc<ScriptedLauncher>, console: Arc<ConsoleBuffer>) -> TunnelSupervisor {
    TunnelSupervisor::new(
        TunnelEndpoint::new("mc", "relay.example.net", 25565, 25565),
        launcher,
        console,
    )
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
