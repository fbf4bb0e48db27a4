//! Human-facing status for both supervisors.
//!
//! Derivation is a pure function of four flags. The aggregator task
//! recomputes it on every supervisor event and on a fixed tick, so the
//! display converges even when a process dies without saying so.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::supervisor::{
    ServerSupervisor, SupervisorEvent, SupervisorSnapshot, SupervisorState, TunnelSupervisor,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub starting: bool,
    pub stopping: bool,
    pub running: bool,
    pub ready: bool,
}

impl From<SupervisorSnapshot> for StatusFlags {
    fn from(snapshot: SupervisorSnapshot) -> Self {
        Self {
            starting: snapshot.state == SupervisorState::Starting,
            stopping: snapshot.state == SupervisorState::Stopping,
            running: snapshot.state.is_active(),
            ready: snapshot.state == SupervisorState::Ready,
        }
    }
}

impl StatusFlags {
    /// Flags with `running` taken from the handle rather than the state. ssh
    /// prints nothing once connected, so liveness is the tunnel's only evidence.
    pub fn from_liveness(snapshot: SupervisorSnapshot) -> Self {
        Self {
            running: snapshot.running,
            ..Self::from(snapshot)
        }
    }
}

/// Display colour class: green, red, amber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Good,
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Ready,
    Starting,
    Stopping,
    NotRunning,
}

impl ServerStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ready => "Server: fully started",
            Self::Starting => "Server: starting",
            Self::Stopping => "Server: stopping",
            Self::NotRunning => "Server: not running",
        }
    }

    pub fn tone(self) -> Tone {
        match self {
            Self::Ready => Tone::Good,
            Self::Starting | Self::Stopping => Tone::Busy,
            Self::NotRunning => Tone::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Starting,
    Stopping,
    Connected,
    NotRunning,
}

impl TunnelStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "SSH tunnel: starting",
            Self::Stopping => "SSH tunnel: stopping",
            Self::Connected => "SSH tunnel: running",
            Self::NotRunning => "SSH tunnel: not running",
        }
    }

    pub fn tone(self) -> Tone {
        match self {
            Self::Connected => Tone::Good,
            Self::Starting | Self::Stopping => Tone::Busy,
            Self::NotRunning => Tone::Idle,
        }
    }
}

/// ready > starting or running-but-not-ready > stopping > idle
pub fn server_status(flags: StatusFlags) -> ServerStatus {
    if flags.ready {
        ServerStatus::Ready
    } else if flags.starting || (flags.running && !flags.ready) {
        ServerStatus::Starting
    } else if flags.stopping {
        ServerStatus::Stopping
    } else {
        ServerStatus::NotRunning
    }
}

/// starting > stopping > running > idle
pub fn tunnel_status(flags: StatusFlags) -> TunnelStatus {
    if flags.starting {
        TunnelStatus::Starting
    } else if flags.stopping {
        TunnelStatus::Stopping
    } else if flags.running {
        TunnelStatus::Connected
    } else {
        TunnelStatus::NotRunning
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine<S> {
    pub status: S,
    pub label: &'static str,
    pub tone: Tone,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub server: StatusLine<ServerStatus>,
    pub tunnel: StatusLine<TunnelStatus>,
}

impl StatusReport {
    pub fn derive(server: SupervisorSnapshot, tunnel: SupervisorSnapshot) -> Self {
        let s = server_status(server.into());
        let t = tunnel_status(StatusFlags::from_liveness(tunnel));
        Self {
            server: StatusLine {
                status: s,
                label: s.label(),
                tone: s.tone(),
                pid: server.pid,
            },
            tunnel: StatusLine {
                status: t,
                label: t.label(),
                tone: t.tone(),
                pid: tunnel.pid,
            },
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.server.label, self.tunnel.label)
    }
}

pub struct StatusAggregator {
    server: Arc<ServerSupervisor>,
    tunnel: Arc<TunnelSupervisor>,
    interval: Duration,
}

impl StatusAggregator {
    pub fn new(server: Arc<ServerSupervisor>, tunnel: Arc<TunnelSupervisor>) -> Self {
        Self {
            server,
            tunnel,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn report(&self) -> StatusReport {
        StatusReport::derive(self.server.snapshot(), self.tunnel.snapshot())
    }

    /// Run until `cancel` fires, publishing every change on the returned channel.
    pub fn spawn(self, cancel: CancellationToken) -> (watch::Receiver<StatusReport>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(self.report());
        let handle = tokio::spawn(async move { self.run(tx, cancel).await });
        (rx, handle)
    }

    async fn run(self, tx: watch::Sender<StatusReport>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut server_events = Some(self.server.subscribe());
        let mut tunnel_events = Some(self.tunnel.subscribe());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = next_event(&mut server_events) => {}
                _ = next_event(&mut tunnel_events) => {}
            }

            let report = self.report();
            let changed = tx.send_if_modified(|current| {
                if *current == report {
                    return false;
                }
                *current = report.clone();
                true
            });
            if changed {
                tracing::info!("Status: {}", report);
            }
        }
        tracing::debug!("Status aggregator stopped");
    }
}

/// Wait for the next event; pends forever once the channel is closed.
async fn next_event(rx: &mut Option<broadcast::Receiver<SupervisorEvent>>) {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(_) => {}
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::debug!("Status aggregator skipped {} events", skipped);
        }
        Err(broadcast::error::RecvError::Closed) => *rx = None,
    }
}
