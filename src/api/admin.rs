//! Admin API handlers: deployment status inspection, stop/rollback, exec,
//! the raw TCP tunnel, and the SSE log surfaces. Container creation from an
//! image (the layer upload/assembly surface) is explicitly out of core per
//! the daemon's scope — this daemon discovers containers a deployer already
//! started with the label schema; it does not start them itself.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{error, warn};

use crate::api::error::ApiError;
use crate::runtime::LogLine;
use crate::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeployRequest {
    #[serde(rename = "deploymentID")]
    #[allow(dead_code)]
    deployment_id: String,
    #[serde(rename = "targetConfig")]
    #[allow(dead_code)]
    target_config: serde_json::Value,
}

/// Validates the request per the documented schema, then reports that
/// execution is out of core: this daemon does not pull images or create
/// containers, it only reconciles containers a deployer already started.
pub async fn deploy(Json(raw): Json<serde_json::Value>) -> Result<Json<serde_json::Value>, ApiError> {
    let _request: DeployRequest =
        serde_json::from_value(raw).map_err(|e| ApiError::bad_request(e.to_string()))?;

    Err(ApiError::not_implemented(
        "container creation from an image is out of core scope; start the container \
         with the documented label schema and this daemon will discover it",
    ))
}

pub async fn deploy_logs(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let container_id = discovery
        .apps
        .values()
        .flatten()
        .find(|r| r.labels.deployment_id == deployment_id)
        .map(|r| r.container_id.clone())
        .ok_or_else(|| ApiError::not_found("no container found for this deployment id"))?;

    let lines = state
        .runtime
        .logs(&container_id, 100, true)
        .await
        .map_err(|e| ApiError::engine_error(e.to_string()))?;

    let events = lines.map(|line| Ok(Event::default().data(format_log_line(&line))));
    Ok(Sse::new(events).keep_alive(keepalive()))
}

// ---------------------------------------------------------------------
// Layer upload surface — out of core (spec.md §1 Non-goals)
// ---------------------------------------------------------------------

pub async fn images_upload() -> ApiError {
    ApiError::not_implemented("image layer upload is out of core scope")
}
pub async fn layers_check() -> ApiError {
    ApiError::not_implemented("image layer upload is out of core scope")
}
pub async fn layers_upload() -> ApiError {
    ApiError::not_implemented("image layer upload is out of core scope")
}
pub async fn images_assemble() -> ApiError {
    ApiError::not_implemented("image layer assembly is out of core scope")
}
pub async fn version() -> ApiError {
    ApiError::not_implemented("release/upgrade flow is out of core scope")
}
pub async fn upgrade() -> ApiError {
    ApiError::not_implemented("release/upgrade flow is out of core scope")
}
pub async fn upgrade_restart() -> ApiError {
    ApiError::not_implemented("release/upgrade flow is out of core scope")
}

// ---------------------------------------------------------------------
// Daemon log stream
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(rename = "access-logs")]
    access_logs: Option<bool>,
}

pub async fn daemon_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let include_access_logs = query.access_logs.unwrap_or(false);
    let rx = state.daemon_log.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(move |item| {
            let include_access_logs = include_access_logs;
            async move {
                match item {
                    Ok(line) if line.is_access_log && !include_access_logs => None,
                    Ok(line) => Some(Ok(Event::default().data(format!("[{}] {} {}", line.level, line.target, line.message)))),
                    Err(_) => None,
                }
            }
        });
    Sse::new(stream).keep_alive(keepalive())
}

// ---------------------------------------------------------------------
// Status / rollback
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ReplicaStatus {
    container_id: String,
    ip: String,
    port: u16,
    deployment_id: String,
    healthy: bool,
}

pub async fn app_status(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> Result<Json<Vec<ReplicaStatus>>, ApiError> {
    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let healthy_ids: std::collections::HashSet<String> =
        state.health.get_healthy_targets().into_iter().map(|t| t.id).collect();

    let Some(replicas) = discovery.apps.get(&app) else {
        return Err(ApiError::not_found(format!("no such app: {app}")));
    };

    let statuses = replicas
        .iter()
        .map(|r| ReplicaStatus {
            container_id: r.container_id.clone(),
            ip: r.ip.clone(),
            port: r.labels.port.parse().unwrap_or(0),
            deployment_id: r.labels.deployment_id.clone(),
            healthy: healthy_ids.contains(&r.container_id),
        })
        .collect();

    Ok(Json(statuses))
}

#[derive(Debug, Serialize)]
pub struct RollbackCandidate {
    deployment_id: String,
    container_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RollbackInfo {
    current: Option<String>,
    superseded: Vec<RollbackCandidate>,
}

pub async fn rollback_status(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> Result<Json<RollbackInfo>, ApiError> {
    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let Some(replicas) = discovery.apps.get(&app) else {
        return Err(ApiError::not_found(format!("no such app: {app}")));
    };

    let mut by_id: HashMap<String, Vec<String>> = HashMap::new();
    for r in replicas {
        by_id.entry(r.labels.deployment_id.clone()).or_default().push(r.container_id.clone());
    }
    let current = by_id.keys().max().cloned();
    let superseded = by_id
        .into_iter()
        .filter(|(id, _)| Some(id) != current.as_ref())
        .map(|(deployment_id, container_ids)| RollbackCandidate { deployment_id, container_ids })
        .collect();

    Ok(Json(RollbackInfo { current, superseded }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackRequest {
    app: String,
    #[serde(rename = "deploymentID")]
    deployment_id: String,
}

/// Stops and removes every container of `app` newer than `deploymentID`,
/// letting the reconciler's next pass (triggered by the resulting
/// stop/die engine events) promote `deploymentID` back to current.
pub async fn rollback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let Some(replicas) = discovery.apps.get(&req.app) else {
        return Err(ApiError::not_found(format!("no such app: {}", req.app)));
    };

    let targets: Vec<String> = replicas
        .iter()
        .filter(|r| r.labels.deployment_id.as_str() > req.deployment_id.as_str())
        .map(|r| r.container_id.clone())
        .collect();

    if targets.is_empty() {
        return Err(ApiError::conflict("no newer deployment to roll back"));
    }

    for id in &targets {
        if let Err(e) = state.runtime.stop(id, Duration::from_secs(10)).await {
            warn!(container = %id, error = %e, "failed to stop container during rollback");
            continue;
        }
        if let Err(e) = state.runtime.remove(id, false).await {
            warn!(container = %id, error = %e, "failed to remove container during rollback");
        }
    }

    Ok(Json(serde_json::json!({ "rolledBackTo": req.deployment_id, "stopped": targets })))
}

// ---------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    #[serde(rename = "remove-containers")]
    remove_containers: Option<bool>,
    #[serde(rename = "remove-volumes")]
    #[allow(dead_code)]
    remove_volumes: Option<bool>,
}

/// Accepted immediately (202); the actual stop (and optional remove) runs
/// asynchronously, per spec.
pub async fn stop_app(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let Some(replicas) = discovery.apps.get(&app).cloned() else {
        return Err(ApiError::not_found(format!("no such app: {app}")));
    };
    let remove = query.remove_containers.unwrap_or(false);

    let runtime = state.runtime.clone();
    tokio::spawn(async move {
        for replica in replicas {
            if let Err(e) = runtime.stop(&replica.container_id, Duration::from_secs(10)).await {
                error!(container = %replica.container_id, error = %e, "failed to stop container");
                continue;
            }
            if remove {
                if let Err(e) = runtime.remove(&replica.container_id, false).await {
                    error!(container = %replica.container_id, error = %e, "failed to remove container");
                }
            }
        }
    });

    Ok((axum::http::StatusCode::ACCEPTED, Json(serde_json::json!({ "app": app, "status": "stopping" }))))
}

// ---------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecRequest {
    command: Vec<String>,
    #[serde(rename = "containerID")]
    container_id: Option<String>,
    #[serde(rename = "allContainers")]
    all_containers: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ExecResult {
    #[serde(rename = "containerID")]
    container_id: String,
    #[serde(rename = "exitCode")]
    exit_code: i32,
    stdout: String,
    stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn exec(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<Vec<ExecResult>>, ApiError> {
    if req.container_id.is_some() && req.all_containers.unwrap_or(false) {
        return Err(ApiError::bad_request("containerID and allContainers are mutually exclusive"));
    }
    if req.command.is_empty() {
        return Err(ApiError::bad_request("command must not be empty"));
    }

    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let Some(replicas) = discovery.apps.get(&app) else {
        return Err(ApiError::not_found(format!("no such app: {app}")));
    };

    let selected: Vec<String> = if req.all_containers.unwrap_or(false) {
        replicas.iter().map(|r| r.container_id.clone()).collect()
    } else if let Some(prefix) = &req.container_id {
        replicas
            .iter()
            .filter(|r| r.container_id.starts_with(prefix.as_str()))
            .map(|r| r.container_id.clone())
            .collect()
    } else {
        return Err(ApiError::bad_request("either containerID or allContainers must be set"));
    };

    if selected.is_empty() {
        return Err(ApiError::not_found("no matching containers"));
    }

    let runtime = state.runtime.clone();
    let command = req.command;
    let results = futures::future::join_all(selected.into_iter().map(|container_id| {
        let runtime = runtime.clone();
        let command = command.clone();
        async move {
            let outcome = tokio::time::timeout(Duration::from_secs(60), runtime.run_command(&container_id, command)).await;
            match outcome {
                Ok(Ok(result)) => ExecResult {
                    container_id,
                    exit_code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                    error: None,
                },
                Ok(Err(e)) => ExecResult { container_id, exit_code: -1, stdout: String::new(), stderr: String::new(), error: Some(e.to_string()) },
                Err(_) => ExecResult {
                    container_id,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some("exec timed out after 60s".to_string()),
                },
            }
        }
    }))
    .await;

    Ok(Json(results))
}

// ---------------------------------------------------------------------
// Tunnel — raw TCP hijack
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    port: u16,
    container: Option<String>,
}

/// Hijacks the admin connection and bidirectionally copies bytes between
/// the caller and `container:port`, mirroring the proxy's own WebSocket
/// tunnel (`proxy::service::tunnel_websocket`) but for an arbitrary port.
pub async fn tunnel(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    Query(query): Query<TunnelQuery>,
    mut req: axum::extract::Request,
) -> Result<impl IntoResponse, ApiError> {
    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let Some(replicas) = discovery.apps.get(&app) else {
        return Err(ApiError::not_found(format!("no such app: {app}")));
    };

    let replica = match &query.container {
        Some(prefix) => replicas.iter().find(|r| r.container_id.starts_with(prefix.as_str())),
        None => replicas.first(),
    }
    .ok_or_else(|| ApiError::not_found("no matching container"))?;

    let addr = format!("{}:{}", replica.ip, query.port);

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let mut backend = match TcpStream::connect(&addr).await {
            Ok(s) => s,
            Err(e) => {
                error!(%addr, error = %e, "tunnel failed to dial container");
                return;
            }
        };
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut io = hyper_util::rt::TokioIo::new(upgraded);
                if let Err(e) = tokio::io::copy_bidirectional(&mut io, &mut backend).await {
                    warn!(%addr, error = %e, "tunnel closed with error");
                }
            }
            Err(e) => error!(error = %e, "tunnel connection upgrade failed"),
        }
    });

    Ok(Response101SwitchingProtocols)
}

struct Response101SwitchingProtocols;

impl IntoResponse for Response101SwitchingProtocols {
    fn into_response(self) -> axum::response::Response {
        axum::response::Response::builder()
            .status(101)
            .header(axum::http::header::UPGRADE, "tcp")
            .header(axum::http::header::CONNECTION, "Upgrade")
            .body(Body::empty())
            .expect("static switching-protocols response is well-formed")
    }
}

// ---------------------------------------------------------------------
// Per-app merged log stream
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AppLogsQuery {
    tail: Option<usize>,
    #[serde(rename = "containerId")]
    container_id: Option<String>,
    #[serde(rename = "allContainers")]
    all_containers: Option<bool>,
}

pub async fn app_logs_stream(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    Query(query): Query<AppLogsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let discovery = state.deploy.discover().await.map_err(ApiError::from)?;
    let Some(replicas) = discovery.apps.get(&app) else {
        return Err(ApiError::not_found(format!("no such app: {app}")));
    };

    let selected: Vec<String> = if query.all_containers.unwrap_or(false) {
        replicas.iter().map(|r| r.container_id.clone()).collect()
    } else if let Some(id) = &query.container_id {
        replicas.iter().filter(|r| r.container_id.starts_with(id.as_str())).map(|r| r.container_id.clone()).collect()
    } else {
        replicas.iter().map(|r| r.container_id.clone()).collect()
    };

    let tail = query.tail.unwrap_or(50);
    let mut streams = Vec::with_capacity(selected.len());
    for container_id in selected {
        match state.runtime.logs(&container_id, tail, true).await {
            Ok(s) => streams.push(s.map(move |line| (container_id.clone(), line)).boxed()),
            Err(e) => warn!(container = %container_id, error = %e, "failed to open log stream"),
        }
    }

    let merged = stream::select_all(streams)
        .map(|(container_id, line)| Ok(Event::default().data(format!("{container_id} {}", format_log_line(&line)))));

    Ok(Sse::new(merged).keep_alive(keepalive()))
}

fn format_log_line(line: &LogLine) -> String {
    format!("{} {}", line.timestamp, line.message)
}

fn keepalive() -> KeepAlive {
    KeepAlive::new().interval(Duration::from_secs(30)).text(": keepalive")
}
