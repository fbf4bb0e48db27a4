mod common;

use std::sync::Arc;

use common::{tunnel, wait_for, ScriptedLauncher};
use mcwarden::console::ConsoleBuffer;
use mcwarden::supervisor::{SupervisorState, TunnelEndpoint, TunnelSupervisor};

#[tokio::test]
async fn connect_and_stop() {
    let launcher = ScriptedLauncher::new();
    let console = Arc::new(ConsoleBuffer::new());
    let sup = tunnel(launcher.clone(), console.clone());

    sup.start();
    assert_eq!(sup.state(), SupervisorState::Starting);
    assert!(wait_for(|| sup.is_connected()).await);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(console.count_matching("SSH tunnel established."), 1);

    let process = launcher.last().unwrap();
    assert_eq!(
        process.spec.command_line(),
        "ssh -N -R 25565:localhost:25565 mc@relay.example.net"
    );

    sup.stop();
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(sup.manual_stop());
    assert!(!process.is_alive());
    assert_eq!(console.count_matching("SSH tunnel stopped manually."), 1);
}

#[tokio::test]
async fn stop_before_connect_wins() {
    let launcher = ScriptedLauncher::new();
    let console = Arc::new(ConsoleBuffer::new());
    let sup = tunnel(launcher.clone(), console);

    // the connect attempt is queued but has not run yet
    sup.start();
    sup.stop();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(launcher.launches(), 0);
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_running());
}

#[tokio::test]
async fn stop_then_start_reconnects() {
    let launcher = ScriptedLauncher::new();
    let console = Arc::new(ConsoleBuffer::new());
    let sup = tunnel(launcher.clone(), console.clone());

    sup.start();
    assert!(wait_for(|| sup.is_connected()).await);
    let first = launcher.last().unwrap();

    // the first run's output has not been drained when the new attempt begins
    sup.stop();
    sup.start();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert!(!first.is_alive());
    assert_eq!(launcher.launches(), 2);
    assert_eq!(sup.state(), SupervisorState::Running);
    assert!(sup.is_connected());
    let snapshot = sup.snapshot();
    assert!(snapshot.running);
    assert_eq!(snapshot.state, SupervisorState::Running);
    assert_eq!(console.count_matching("SSH tunnel established."), 2);
    assert_eq!(console.count_matching("SSH tunnel is already running or starting."), 0);

    sup.start();
    assert_eq!(console.count_matching("SSH tunnel is already running or starting."), 1);
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn start_clears_manual_stop() {
    let launcher = ScriptedLauncher::new();
    let console = Arc::new(ConsoleBuffer::new());
    let sup = tunnel(launcher.clone(), console);

    sup.stop();
    assert!(sup.manual_stop());
    sup.start();
    assert!(!sup.manual_stop());
    assert!(wait_for(|| sup.is_connected()).await);
}

#[tokio::test]
async fn second_start_is_refused() {
    let launcher = ScriptedLauncher::new();
    let console = Arc::new(ConsoleBuffer::new());
    let sup = tunnel(launcher.clone(), console.clone());

    sup.start();
    sup.start();
    assert!(wait_for(|| sup.is_connected()).await);
    sup.start();

    assert_eq!(launcher.launches(), 1);
    assert_eq!(console.count_matching("SSH tunnel is already running or starting."), 2);
}

#[tokio::test]
async fn missing_host_never_launches() {
    let launcher = ScriptedLauncher::new();
    let console = Arc::new(ConsoleBuffer::new());
    let sup = TunnelSupervisor::new(TunnelEndpoint::new("mc", "", 25565, 25565), launcher.clone(), console.clone());

    sup.start();
    assert!(wait_for(|| console.count_matching("Tunnel error") == 1).await);
    assert_eq!(launcher.launches(), 0);
    assert_eq!(sup.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn ssh_exit_returns_to_idle_without_reconnect() {
    let launcher = ScriptedLauncher::with_script(&["Connection to relay.example.net closed by remote host."]);
    let console = Arc::new(ConsoleBuffer::new());
    let sup = tunnel(launcher.clone(), console);

    sup.start();
    assert!(wait_for(|| sup.is_connected()).await);
    launcher.last().unwrap().exit();

    assert!(wait_for(|| sup.state() == SupervisorState::Idle).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(launcher.launches(), 1);
    assert!(!sup.manual_stop());
}

#[tokio::test]
async fn error_lines_reach_console() {
    let launcher = ScriptedLauncher::with_script(&["Warning: remote port forwarding failed for listen port 25565"]);
    let console = Arc::new(ConsoleBuffer::new());
    let sup = tunnel(launcher.clone(), console.clone());

    sup.start();
    assert!(wait_for(|| console.count_matching("remote port forwarding failed") == 1).await);
}
