//! HTTP command and status surface for a front end.
//!
//! Commands are fire-and-forget: handlers queue the supervisor call and answer
//! `202 Accepted`; outcomes show up in `/api/status` and `/api/console`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::status::StatusReport;
use crate::supervisor::{Supervisor, SupervisorError};

/// Lines returned by `/api/console` when neither `since` nor `count` is given.
const DEFAULT_CONSOLE_LINES: usize = 200;

pub const HELP_TEXT: &str = "\
Start Server: launches the Minecraft server.
Stop Server: asks the server to shut down.
Restart Server: stops the server, waits briefly, then starts it again.
New World: archives the current world into the backup folder, deletes it, then starts the server so a fresh world is generated.
Start Tunnel: opens the reverse SSH tunnel to the relay host.
Stop Tunnel: closes the SSH tunnel.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceDataRequest {
    /// Overrides the configured backup directory.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

impl CommandResponse {
    fn accepted(message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::ACCEPTED,
            Json(Self {
                success: true,
                message: message.into(),
            }),
        )
    }
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(get_status))
            .route("/api/console", get(get_console))
            .route("/api/help", get(get_help))
            .route("/api/server/start", post(start_server_handler))
            .route("/api/server/stop", post(stop_server_handler))
            .route("/api/server/restart", post(restart_server_handler))
            .route("/api/server/replace-data", post(replace_data_handler))
            .route("/api/tunnel/start", post(start_tunnel_handler))
            .route("/api/tunnel/stop", post(stop_tunnel_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("IPC server stopped");
        Ok(())
    }
}

/// GET /api/status
async fn get_status(State(state): State<IPCServer>) -> impl IntoResponse {
    let sup = &state.supervisor;
    let report = StatusReport::derive(sup.server.snapshot(), sup.tunnel.snapshot());
    Json(json!({
        "summary": report.to_string(),
        "server": report.server,
        "tunnel": report.tunnel,
    }))
}

/// GET /api/console?since=<id>&count=<n>
async fn get_console(
    State(state): State<IPCServer>,
    Query(query): Query<ConsoleQuery>,
) -> impl IntoResponse {
    let console = &state.supervisor.console;
    let mut lines = match query.since {
        Some(id) => console.since(id),
        None => console.recent(query.count.unwrap_or(DEFAULT_CONSOLE_LINES)),
    };
    if let (Some(_), Some(count)) = (query.since, query.count) {
        lines.truncate(count);
    }
    let last_id = lines.last().map(|l| l.id);
    Json(json!({ "lines": lines, "last_id": last_id }))
}

/// GET /api/help
async fn get_help() -> impl IntoResponse {
    Json(json!({ "help": HELP_TEXT }))
}

/// POST /api/server/start
async fn start_server_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    let server = Arc::clone(&state.supervisor.server);
    tokio::spawn(async move { server.start().await });
    CommandResponse::accepted("Server start requested")
}

/// POST /api/server/stop
async fn stop_server_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    let server = Arc::clone(&state.supervisor.server);
    tokio::spawn(async move { server.stop().await });
    CommandResponse::accepted("Server stop requested")
}

/// POST /api/server/restart
async fn restart_server_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    let server = Arc::clone(&state.supervisor.server);
    tokio::spawn(async move { server.restart().await });
    CommandResponse::accepted("Server restart requested")
}

/// POST /api/server/replace-data
async fn replace_data_handler(
    State(state): State<IPCServer>,
    payload: Option<Json<ReplaceDataRequest>>,
) -> Result<(StatusCode, Json<CommandResponse>), SupervisorError> {
    let backup_dir = payload
        .and_then(|Json(req)| req.backup_dir)
        .unwrap_or_else(|| state.supervisor.backup_dir().clone());
    state.supervisor.server.validate_backup_dir(&backup_dir)?;

    let server = Arc::clone(&state.supervisor.server);
    let target = backup_dir.clone();
    tokio::spawn(async move {
        if let Err(e) = server.replace_data_and_restart(&target).await {
            tracing::warn!("Replace world failed: {}", e);
        }
    });
    Ok(CommandResponse::accepted(format!(
        "World will be archived to {}",
        backup_dir.display()
    )))
}

/// POST /api/tunnel/start
async fn start_tunnel_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    state.supervisor.tunnel.start();
    CommandResponse::accepted("Tunnel start requested")
}

/// POST /api/tunnel/stop
async fn stop_tunnel_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    state.supervisor.tunnel.stop();
    CommandResponse::accepted("Tunnel stop requested")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::AppConfig;

    fn test_server(root: &std::path::Path) -> IPCServer {
        let mut config = AppConfig::default();
        config.paths.server_files = root.join("server_files");
        config.paths.backups = root.join("world_backups");
        config.server.java = "mcwarden-test-no-such-java".into();
        IPCServer::new(Arc::new(Supervisor::new(&config)), "127.0.0.1:0")
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_starts_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_server(tmp.path()).router();
        let resp = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["server"]["status"], "not_running");
        assert_eq!(body["tunnel"]["status"], "not_running");
        assert_eq!(body["summary"], "Server: not running | SSH tunnel: not running");
    }

    #[tokio::test]
    async fn replace_data_rejects_backup_inside_world() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_server(tmp.path()).router();
        let inside = tmp.path().join("server_files").join("world").join("backups");
        let req = Request::post("/api/server/replace-data")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "backup_dir": inside }).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error_code"], "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn commands_are_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_server(tmp.path()).router();
        let resp = app
            .oneshot(Request::post("/api/server/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn tunnel_stop_is_logged_to_console() {
        let tmp = tempfile::tempdir().unwrap();
        let server = test_server(tmp.path());
        let app = server.router();
        let resp = app
            .clone()
            .oneshot(Request::post("/api/tunnel/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = app
            .oneshot(Request::get("/api/console?count=10").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        let lines = body["lines"].as_array().unwrap();
        assert!(lines
            .iter()
            .any(|l| l["text"] == "SSH tunnel is not running." && l["origin"] == "tunnel"));
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_server(tmp.path()).router();
        let resp = app
            .oneshot(Request::get("/api/help").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert!(body["help"].as_str().unwrap().contains("New World"));
    }
}
