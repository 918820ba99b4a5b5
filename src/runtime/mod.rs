//! Engine adapter (C1): a thin, engine-agnostic contract over the local
//! container runtime. Concrete impls live in [`docker`] and [`podman`];
//! [`NoopRuntime`] is the fallback when no engine is reachable.

pub mod docker;
pub mod podman;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::config::RuntimeConfig;

pub use docker::DockerRuntime;
pub use podman::PodmanRuntime;

/// A running or stopped container as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Engine-reported lifecycle state: `running`, `restarting`, `exited`, ...
    pub state: String,
    pub running: bool,
    /// Exit code, populated once the container has exited.
    pub exit_code: Option<i64>,
    /// Labels attached to the container (the label schema, C2, is decoded
    /// from this map).
    pub labels: HashMap<String, String>,
    /// Exposed container-side ports (not host bindings — this daemon does
    /// not rely on host port publishing; it dials containers directly on
    /// their network IP).
    pub exposed_ports: Vec<u16>,
    /// Per-network IPv4 addresses the container holds.
    pub networks: HashMap<String, String>,
    /// Engine-side health status, if the image declares a HEALTHCHECK.
    pub health: Option<EngineHealth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineHealthStatus {
    Healthy,
    Starting,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub status: EngineHealthStatus,
    /// Last line of the healthcheck probe's log, if any.
    pub last_log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: String,
    pub message: String,
    pub stream: LogStream,
}

/// One lifecycle event from [`ContainerRuntime::subscribe_events`], already
/// filtered to the actions the reconciler cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub action: EventAction,
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Restart,
    Die,
    Stop,
    Kill,
}

impl EventAction {
    fn from_docker_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "restart" => Some(Self::Restart),
            "die" => Some(Self::Die),
            "stop" => Some(Self::Stop),
            "kill" => Some(Self::Kill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TtySize {
    pub cols: u16,
    pub rows: u16,
}

/// A live exec session: bytes written to `stdin_tx` reach the process,
/// bytes produced by the process arrive on `stdout_rx` (stdout and stderr
/// multiplexed together), and `resize_tx` carries TTY resize requests.
pub struct ExecHandle {
    pub stdin_tx: mpsc::Sender<Bytes>,
    pub stdout_rx: mpsc::Receiver<Bytes>,
    pub resize_tx: mpsc::Sender<TtySize>,
    pub exit_code: tokio::sync::oneshot::Receiver<i64>,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Thin contract over the container engine (C1 in the component design):
/// list, inspect, start, stop, remove, exec, stream logs, subscribe to
/// lifecycle events.
///
/// Failure semantics: a not-found error on `inspect`/`remove` is not an
/// error once the caller has issued a stop+remove — callers that rely on
/// idempotent teardown should treat `Ok(())` and a not-found `Err` as
/// equivalent; this trait surfaces not-found as a plain `Err` and leaves
/// the idempotency check to callers (see `reconcile::stop_superseded`)
/// since "has this id already been removed" is a caller-level concept, not
/// an engine one.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers carrying the `app` label, optionally narrowed to one
    /// app name.
    async fn list_containers(&self, app: Option<&str>) -> anyhow::Result<Vec<ContainerInfo>>;

    async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerInfo>;

    async fn start(&self, container_id: &str) -> anyhow::Result<()>;

    /// Stop with a grace period, falling back to a forceful kill once it
    /// elapses.
    async fn stop(&self, container_id: &str, grace: std::time::Duration) -> anyhow::Result<()>;

    async fn remove(&self, container_id: &str, force: bool) -> anyhow::Result<()>;

    /// Tail + follow logs for a container.
    async fn logs(
        &self,
        container_id: &str,
        tail: usize,
        follow: bool,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = LogLine> + Send>>>;

    async fn exec(&self, config: &ExecConfig) -> anyhow::Result<ExecHandle>;

    async fn run_command(&self, container_id: &str, cmd: Vec<String>) -> anyhow::Result<CommandResult>;

    /// Whether the engine is currently reachable.
    async fn is_available(&self) -> bool;

    /// Subscribe to lifecycle events, already filtered to
    /// `start|restart|die|stop|kill`.
    async fn subscribe_events(&self) -> anyhow::Result<Pin<Box<dyn Stream<Item = EngineEvent> + Send>>>;
}

/// Fallback used when no engine could be reached at startup; every call
/// fails loudly except the cheap availability/listing probes so the daemon
/// can still boot its proxy and admin API for diagnosis.
pub struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    async fn list_containers(&self, _app: Option<&str>) -> anyhow::Result<Vec<ContainerInfo>> {
        Ok(Vec::new())
    }

    async fn inspect(&self, _container_id: &str) -> anyhow::Result<ContainerInfo> {
        anyhow::bail!("no container runtime available")
    }

    async fn start(&self, _container_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("no container runtime available")
    }

    async fn stop(&self, _container_id: &str, _grace: std::time::Duration) -> anyhow::Result<()> {
        anyhow::bail!("no container runtime available")
    }

    async fn remove(&self, _container_id: &str, _force: bool) -> anyhow::Result<()> {
        anyhow::bail!("no container runtime available")
    }

    async fn logs(
        &self,
        _container_id: &str,
        _tail: usize,
        _follow: bool,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = LogLine> + Send>>> {
        anyhow::bail!("no container runtime available")
    }

    async fn exec(&self, _config: &ExecConfig) -> anyhow::Result<ExecHandle> {
        anyhow::bail!("no container runtime available")
    }

    async fn run_command(&self, _container_id: &str, _cmd: Vec<String>) -> anyhow::Result<CommandResult> {
        anyhow::bail!("no container runtime available")
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn subscribe_events(&self) -> anyhow::Result<Pin<Box<dyn Stream<Item = EngineEvent> + Send>>> {
        anyhow::bail!("no container runtime available")
    }
}

/// Detect and connect to a container engine per `config.kind` (or try
/// docker then podman on `Auto`), falling back to [`NoopRuntime`] with a
/// warning so the daemon still starts.
pub async fn detect_runtime(config: &RuntimeConfig) -> std::sync::Arc<dyn ContainerRuntime> {
    use crate::config::RuntimeKind;

    match config.kind {
        RuntimeKind::Docker => match DockerRuntime::new(&config.docker_socket) {
            Ok(rt) if rt.is_available().await => std::sync::Arc::new(rt),
            _ => {
                tracing::warn!("configured docker runtime unavailable, falling back to noop");
                std::sync::Arc::new(NoopRuntime)
            }
        },
        RuntimeKind::Podman => std::sync::Arc::new(PodmanRuntime::new()),
        RuntimeKind::Auto => {
            if let Ok(rt) = DockerRuntime::new(&config.docker_socket) {
                if rt.is_available().await {
                    return std::sync::Arc::new(rt);
                }
            }
            let podman = PodmanRuntime::new();
            if podman.is_available().await {
                return std::sync::Arc::new(podman);
            }
            tracing::warn!("no container runtime detected, falling back to noop");
            std::sync::Arc::new(NoopRuntime)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_action_filters_unknown_actions() {
        assert_eq!(EventAction::from_docker_action("start"), Some(EventAction::Start));
        assert_eq!(EventAction::from_docker_action("exec_create"), None);
        assert_eq!(EventAction::from_docker_action("die"), Some(EventAction::Die));
    }

    #[tokio::test]
    async fn noop_runtime_lists_empty_and_fails_mutations() {
        let rt = NoopRuntime;
        assert!(rt.list_containers(None).await.unwrap().is_empty());
        assert!(rt.inspect("x").await.is_err());
        assert!(!rt.is_available().await);
    }
}
