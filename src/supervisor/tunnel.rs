//! Reverse SSH tunnel supervision.
//!
//! `start` makes exactly one connection attempt on a background task. There is
//! no reconnect loop: when ssh exits the tunnel goes back to `Idle` and stays
//! there until someone asks again. `manual_stop` keeps a connect attempt that
//! lost the race against `stop` from bringing the tunnel back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::classifier::{OutputClassifier, OutputKind};
use super::core::{ProcessSupervisor, SupervisorEvent, SupervisorSnapshot};
use super::error::SupervisorError;
use super::process::{LaunchSpec, ProcessLauncher};
use super::state_machine::SupervisorState;
use crate::console::{ConsoleSink, Origin};

/// Where the tunnel goes and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub program: String,
    pub user: String,
    pub host: String,
    /// Port opened on the remote host.
    pub local_port: u16,
    /// Port on this machine that the remote port forwards to.
    pub remote_port: u16,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl TunnelEndpoint {
    pub fn new(user: impl Into<String>, host: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            program: "ssh".to_string(),
            user: user.into(),
            host: host.into(),
            local_port,
            remote_port,
            extra_args: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.user.trim().is_empty() {
            return Err(SupervisorError::ConnectionFailure("ssh user is not configured".into()));
        }
        if self.host.trim().is_empty() {
            return Err(SupervisorError::ConnectionFailure("ssh host is not configured".into()));
        }
        Ok(())
    }

    /// `ssh -N -R <local_port>:localhost:<remote_port> user@host`
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::new(&self.program)
            .arg("-N")
            .args(self.extra_args.iter().cloned())
            .arg("-R")
            .arg(format!("{}:localhost:{}", self.local_port, self.remote_port))
            .arg(format!("{}@{}", self.user, self.host))
    }
}

pub struct TunnelSupervisor {
    core: Arc<ProcessSupervisor>,
    endpoint: TunnelEndpoint,
}

impl TunnelSupervisor {
    pub fn new(
        endpoint: TunnelEndpoint,
        launcher: Arc<dyn ProcessLauncher>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        let core = ProcessSupervisor::new(
            "SSH tunnel",
            Origin::Tunnel,
            endpoint.launch_spec(),
            OutputClassifier::ssh_tunnel(),
            launcher,
            console,
        );
        Self {
            core: Arc::new(core),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &TunnelEndpoint {
        &self.endpoint
    }

    /// Begin one connection attempt. Returns immediately.
    pub fn start(&self) {
        {
            let mut st = self.core.lock_reconciled();
            if st.state() == SupervisorState::Starting || st.handle_alive() {
                drop(st);
                self.core
                    .notice(OutputKind::RawLine, "SSH tunnel is already running or starting.");
                return;
            }
            st.move_to(SupervisorState::Starting);
            st.manual_stop = false;
        }

        let core = Arc::clone(&self.core);
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move { connect_once(&core, &endpoint) });
    }

    /// Mark the tunnel as stopped by the operator and terminate ssh if it is up.
    pub fn stop(&self) {
        let mut st = self.core.lock();
        st.manual_stop = true;
        // the drain task of the run being stopped must not touch a later attempt
        st.run_id += 1;

        let mut terminated = false;
        let mut failure = None;
        if let Some(mut handle) = st.handle.take() {
            if handle.is_alive() {
                match handle.terminate() {
                    Ok(()) => terminated = true,
                    Err(e) => failure = Some(e),
                }
            }
        }
        st.machine.reset();
        drop(st);

        match (terminated, failure) {
            (_, Some(e)) => self
                .core
                .notice(OutputKind::ErrorMarker, format!("Failed to stop SSH tunnel: {}", e)),
            (true, None) => self.core.notice(OutputKind::RawLine, "SSH tunnel stopped manually."),
            (false, None) => self.core.notice(OutputKind::RawLine, "SSH tunnel is not running."),
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.core.state() == SupervisorState::Running
    }

    pub fn manual_stop(&self) -> bool {
        self.core.lock().manual_stop
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

/// Runs on its own task. Everything from the guard check to marking the
/// tunnel connected happens under the supervisor lock, so `stop` either
/// lands before (and the attempt is abandoned) or after (and kills ssh).
fn connect_once(core: &Arc<ProcessSupervisor>, endpoint: &TunnelEndpoint) {
    let mut st = core.lock_reconciled();
    if st.manual_stop || st.handle_alive() {
        if st.state() == SupervisorState::Starting {
            st.machine.reset();
        }
        tracing::debug!("Tunnel connect attempt abandoned (manual_stop: {})", st.manual_stop);
        return;
    }

    let attempt = endpoint.validate().and_then(|()| core.launch_locked(&mut st));
    match attempt {
        Ok(_) => {
            st.move_to(SupervisorState::Running);
            drop(st);
            core.notice(OutputKind::ConnectedMarker, "SSH tunnel established.");
        }
        Err(e) => {
            st.machine.reset();
            drop(st);
            core.notice(OutputKind::ErrorMarker, format!("Tunnel error: {}", e));
        }
    }
}
