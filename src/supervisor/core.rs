//! Shared supervision pattern for one external process.
//!
//! All lifecycle data (handle, state, run counter, flags) sits behind a single
//! mutex. The mutex is never held across an `.await`; launching is a plain
//! spawn, and output is drained by a separate task per run.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use super::classifier::{OutputClassifier, OutputEvent, OutputKind};
use super::error::SupervisorError;
use super::process::{LaunchSpec, Liveness, ProcessHandle, ProcessLauncher};
use super::state_machine::{StateMachine, SupervisorState};
use crate::console::{ConsoleSink, Origin};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const EXIT_POLL_ATTEMPTS: usize = 10;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Invoked from the drain task when a run reaches `Ready`.
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Typed notifications published by a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    OutputLine(OutputEvent),
    ReadyReached,
    ProcessExited { code: Option<i32> },
}

/// Consistent point-in-time view of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    /// A handle exists and has not been observed to exit.
    pub running: bool,
}

pub(crate) struct CoreState {
    pub(crate) machine: StateMachine,
    pub(crate) handle: Option<Box<dyn ProcessHandle>>,
    /// Bumped on every launch and tunnel stop; drain tasks from older runs only
    /// forward output.
    pub(crate) run_id: u64,
    ready_fired: bool,
    /// Set by an explicit tunnel stop, cleared by the next explicit start.
    pub(crate) manual_stop: bool,
    on_ready: Option<ReadyCallback>,
}

impl CoreState {
    pub(crate) fn state(&self) -> SupervisorState {
        self.machine.state()
    }

    pub(crate) fn handle_alive(&mut self) -> bool {
        self.handle.as_mut().map(|h| h.is_alive()).unwrap_or(false)
    }

    pub(crate) fn move_to(&mut self, to: SupervisorState) -> bool {
        match self.machine.transition(to) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Ignoring {}", e);
                false
            }
        }
    }

    /// A handle that reports exit means the process is gone, whether or not
    /// a stop marker was seen.
    fn reconcile(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Liveness::Exited(code) = handle.liveness() {
                if self.machine.reset() {
                    tracing::info!("Process exited (code: {:?}) without a stop marker", code);
                }
            }
        }
    }
}

pub struct ProcessSupervisor {
    label: String,
    origin: Origin,
    spec: LaunchSpec,
    classifier: OutputClassifier,
    launch_notice: Option<String>,
    launcher: Arc<dyn ProcessLauncher>,
    console: Arc<dyn ConsoleSink>,
    events: broadcast::Sender<SupervisorEvent>,
    state: Mutex<CoreState>,
}

impl ProcessSupervisor {
    pub fn new(
        label: impl Into<String>,
        origin: Origin,
        spec: LaunchSpec,
        classifier: OutputClassifier,
        launcher: Arc<dyn ProcessLauncher>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            label: label.into(),
            origin,
            spec,
            classifier,
            launch_notice: None,
            launcher,
            console,
            events,
            state: Mutex::new(CoreState {
                machine: StateMachine::new(),
                handle: None,
                run_id: 0,
                ready_fired: false,
                manual_stop: false,
                on_ready: None,
            }),
        }
    }

    /// Notice written when the drain task of a run begins. It does not move the
    /// state; the first line from the process itself does.
    pub fn with_launch_notice(mut self, notice: impl Into<String>) -> Self {
        self.launch_notice = Some(notice.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn set_ready_callback(&self, callback: ReadyCallback) {
        self.lock().on_ready = Some(callback);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("{} state lock poisoned, recovering", self.label);
            poisoned.into_inner()
        })
    }

    /// Lock and fold in any exit the handle has reported since the last look.
    pub(crate) fn lock_reconciled(&self) -> MutexGuard<'_, CoreState> {
        let mut st = self.lock();
        st.reconcile();
        st
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let mut st = self.lock_reconciled();
        let running = st.handle_alive();
        SupervisorSnapshot {
            state: st.state(),
            pid: if running {
                st.handle.as_ref().and_then(|h| h.pid())
            } else {
                None
            },
            running,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.snapshot().state
    }

    pub fn is_running(&self) -> bool {
        self.lock().handle_alive()
    }

    /// Write a lifecycle notice to the console and publish it.
    pub fn notice(&self, kind: OutputKind, text: impl Into<String>) {
        let text = text.into();
        match kind {
            OutputKind::ErrorMarker => tracing::warn!("[{}] {}", self.label, text),
            _ => tracing::info!("[{}] {}", self.label, text),
        }
        self.console.append(self.origin, &text);
        let _ = self.events.send(SupervisorEvent::OutputLine(OutputEvent::new(kind, text)));
    }

    /// Idle -> Starting -> launch. No-op with a notice while a run is live or
    /// in flight. Never waits for readiness.
    pub fn start(self: &Arc<Self>) {
        let mut st = self.lock_reconciled();
        if st.state() == SupervisorState::Starting {
            drop(st);
            self.notice(OutputKind::RawLine, format!("{} is already starting.", self.label));
            return;
        }
        if st.handle_alive() {
            drop(st);
            self.notice(OutputKind::RawLine, format!("{} is already running.", self.label));
            return;
        }

        st.move_to(SupervisorState::Starting);
        if let Err(e) = self.launch_locked(&mut st) {
            st.machine.reset();
            drop(st);
            self.notice(OutputKind::ErrorMarker, format!("{} failed to start: {}", self.label, e));
        }
    }

    /// Send the termination signal. Does not wait for the process to exit;
    /// the drain task or a later liveness check finishes the move to `Idle`.
    pub fn stop(&self) {
        let mut st = self.lock_reconciled();
        if !st.handle_alive() {
            drop(st);
            self.notice(OutputKind::RawLine, format!("{} is not running.", self.label));
            return;
        }
        if st.state() == SupervisorState::Stopping {
            drop(st);
            self.notice(OutputKind::RawLine, format!("{} is already stopping.", self.label));
            return;
        }

        let result = match st.handle.as_mut() {
            Some(handle) => handle.terminate(),
            None => Ok(()),
        };
        if let Err(e) = result {
            drop(st);
            self.notice(OutputKind::ErrorMarker, format!("Failed to stop {}: {}", self.label, e));
            return;
        }
        st.move_to(SupervisorState::Stopping);
        drop(st);
        self.notice(OutputKind::RawLine, format!("Stopping {}...", self.label.to_lowercase()));
    }

    /// Launch the process, install its handle and start draining its output.
    pub(crate) fn launch_locked(self: &Arc<Self>, st: &mut CoreState) -> Result<u64, SupervisorError> {
        let launched = self.launcher.launch(&self.spec)?;
        st.run_id += 1;
        st.ready_fired = false;
        st.handle = Some(launched.handle);
        let run_id = st.run_id;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain(run_id, launched.output).await });
        Ok(run_id)
    }

    async fn drain(self: Arc<Self>, run_id: u64, mut output: mpsc::Receiver<String>) {
        if let Some(text) = &self.launch_notice {
            self.notice(OutputKind::RawLine, text.clone());
        }
        while let Some(line) = output.recv().await {
            let event = self.classifier.classify(&line);
            self.apply(run_id, event);
        }
        // pipes close a moment before the exit status can be collected
        for _ in 0..EXIT_POLL_ATTEMPTS {
            if !self.run_alive(run_id) {
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        self.finish_run(run_id);
    }

    fn run_alive(&self, run_id: u64) -> bool {
        let mut st = self.lock();
        st.run_id == run_id && st.handle_alive()
    }

    /// Forward one line to the console, then fold its kind into the state.
    fn apply(&self, run_id: u64, event: OutputEvent) {
        if event.kind == OutputKind::ErrorMarker {
            tracing::warn!("[{}] {}", self.label, event.text);
        }
        self.console.append(self.origin, &event.text);

        let mut ready_callback = None;
        let mut reached_ready = false;
        {
            let mut st = self.lock();
            if st.run_id == run_id {
                match event.kind {
                    OutputKind::ReadyMarker => {
                        let state = st.state();
                        let live = matches!(state, SupervisorState::Starting | SupervisorState::Running);
                        if live && !st.ready_fired {
                            if state == SupervisorState::Starting {
                                st.move_to(SupervisorState::Running);
                            }
                            st.move_to(SupervisorState::Ready);
                            st.ready_fired = true;
                            reached_ready = true;
                            ready_callback = st.on_ready.clone();
                        }
                    }
                    OutputKind::StoppedMarker => {
                        st.machine.reset();
                    }
                    // any other output means the process is up
                    OutputKind::StartedMarker
                    | OutputKind::ConnectedMarker
                    | OutputKind::RawLine
                    | OutputKind::ErrorMarker => {
                        if st.state() == SupervisorState::Starting {
                            st.move_to(SupervisorState::Running);
                        }
                    }
                }
            }
        }

        let _ = self.events.send(SupervisorEvent::OutputLine(event));
        if reached_ready {
            tracing::info!("{} is ready", self.label);
            if let Some(callback) = ready_callback {
                callback();
            }
            let _ = self.events.send(SupervisorEvent::ReadyReached);
        }
    }

    /// Output ended: drop the handle of this run and return to `Idle`.
    fn finish_run(&self, run_id: u64) {
        let exited = {
            let mut st = self.lock();
            if st.run_id != run_id {
                return;
            }
            st.machine.reset();
            st.handle.take().map(|mut handle| match handle.liveness() {
                Liveness::Exited(code) => code,
                Liveness::Alive => {
                    tracing::warn!(
                        "{} closed its output but is still alive (pid: {:?}); releasing handle",
                        self.label,
                        handle.pid()
                    );
                    None
                }
            })
        };

        if let Some(code) = exited {
            let text = match code {
                Some(code) => format!("{} process exited with code {}.", self.label, code),
                None => format!("{} process exited.", self.label),
            };
            self.notice(OutputKind::RawLine, text);
            let _ = self.events.send(SupervisorEvent::ProcessExited { code });
        }
    }
}
