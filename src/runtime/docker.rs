use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::system::EventsOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::{
    CommandResult, ContainerInfo, ContainerRuntime, EngineEvent, EngineHealth, EngineHealthStatus,
    EventAction, ExecConfig, ExecHandle, LogLine, LogStream, TtySize,
};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(socket: &str) -> Result<Self> {
        let client = if cfg!(windows) || socket.starts_with("npipe://") || socket.starts_with("tcp://") {
            Docker::connect_with_local_defaults()?
        } else {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { client })
    }

    fn info_from_inspect(id: &str, details: bollard::models::ContainerInspectResponse) -> ContainerInfo {
        let name = details
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.to_string());

        let state = details.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let running = state.and_then(|s| s.running).unwrap_or(false);
        let exit_code = state.and_then(|s| s.exit_code);

        let health = state
            .and_then(|s| s.health.as_ref())
            .map(|h| {
                let status = match h.status {
                    Some(bollard::models::HealthStatusEnum::HEALTHY) => EngineHealthStatus::Healthy,
                    Some(bollard::models::HealthStatusEnum::UNHEALTHY) => EngineHealthStatus::Unhealthy,
                    _ => EngineHealthStatus::Starting,
                };
                let last_log = h
                    .log
                    .as_ref()
                    .and_then(|entries| entries.last())
                    .and_then(|e| e.output.clone());
                EngineHealth { status, last_log }
            });

        let labels = details
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let exposed_ports = details
            .config
            .as_ref()
            .and_then(|c| c.exposed_ports.as_ref())
            .map(|ports| {
                ports
                    .keys()
                    .filter_map(|p| p.split('/').next())
                    .filter_map(|p| p.parse::<u16>().ok())
                    .collect()
            })
            .unwrap_or_default();

        let networks = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|nets| {
                nets.iter()
                    .filter_map(|(name, endpoint)| {
                        endpoint
                            .ip_address
                            .as_ref()
                            .filter(|ip| !ip.is_empty())
                            .map(|ip| (name.clone(), ip.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        ContainerInfo {
            id: id.to_string(),
            name,
            state: status,
            running,
            exit_code,
            labels,
            exposed_ports,
            networks,
            health,
        }
    }

    /// `true` if a bollard error represents a 404 from the engine — used to
    /// make `remove`/`inspect` idempotent once the caller already issued a
    /// stop+remove.
    fn is_not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == 404
        )
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, app: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        match app {
            Some(app) => {
                filters.insert("label".to_string(), vec![format!("app={app}")]);
            }
            None => {
                filters.insert("label".to_string(), vec!["app".to_string()]);
            }
        }

        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("docker: list_containers")?;

        let mut out = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(id) = summary.id {
                if let Ok(info) = self.inspect(&id).await {
                    out.push(info);
                }
            }
        }
        Ok(out)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let details = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .context("docker: inspect_container")?;
        Ok(Self::info_from_inspect(container_id, details))
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.client
            .start_container::<String>(container_id, None)
            .await
            .context("docker: start_container")?;
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: std::time::Duration) -> Result<()> {
        let result = self
            .client
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e).context("docker: stop_container"),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let result = self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e).context("docker: remove_container"),
        }
    }

    async fn logs(
        &self,
        container_id: &str,
        tail: usize,
        follow: bool,
    ) -> Result<Pin<Box<dyn Stream<Item = LogLine> + Send>>> {
        let stream = self.client.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow,
                timestamps: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mapped = stream.filter_map(|chunk| async move {
            let chunk = chunk.ok()?;
            let (stream, raw) = match chunk {
                LogOutput::StdOut { message } => (LogStream::Stdout, message),
                LogOutput::StdErr { message } => (LogStream::Stderr, message),
                _ => return None,
            };
            let text = String::from_utf8_lossy(&raw).to_string();
            let (timestamp, message) = split_docker_timestamp(&text);
            Some(LogLine {
                timestamp,
                message,
                stream,
            })
        });

        Ok(Box::pin(mapped))
    }

    async fn exec(&self, config: &ExecConfig) -> Result<ExecHandle> {
        let exec = self
            .client
            .create_exec(
                &config.container_id,
                CreateExecOptions {
                    cmd: Some(config.cmd.clone()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(config.tty),
                    ..Default::default()
                },
            )
            .await
            .context("docker: create_exec")?;

        let start = self
            .client
            .start_exec(&exec.id, None)
            .await
            .context("docker: start_exec")?;

        let (mut output, mut input): (
            Pin<Box<dyn AsyncRead + Send>>,
            Pin<Box<dyn AsyncWrite + Send>>,
        ) = match start {
            StartExecResults::Attached { output, input } => {
                (Box::pin(output.map(|r| r.map(|o| o.into_bytes())).into_async_read()), input)
            }
            StartExecResults::Detached => anyhow::bail!("docker: exec started detached unexpectedly"),
        };

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(32);
        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(32);
        let (resize_tx, mut resize_rx) = mpsc::channel::<TtySize>(8);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if input.write_all(&data).await.is_err() {
                    break;
                }
                let _ = input.flush().await;
            }
        });

        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match output.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdout_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("docker exec stdout closed: {}", e);
                        break;
                    }
                }
            }
        });

        let client = self.client.clone();
        let exec_id = exec.id.clone();
        tokio::spawn(async move {
            while let Some(size) = resize_rx.recv().await {
                let _ = client
                    .resize_exec(
                        &exec_id,
                        ResizeExecOptions {
                            height: size.rows,
                            width: size.cols,
                        },
                    )
                    .await;
            }
        });

        let client = self.client.clone();
        let exec_id = exec.id.clone();
        tokio::spawn(async move {
            for _ in 0..600 {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                if let Ok(inspect) = client.inspect_exec(&exec_id).await {
                    if inspect.running == Some(false) {
                        let _ = exit_tx.send(inspect.exit_code.unwrap_or(-1));
                        return;
                    }
                }
            }
            let _ = exit_tx.send(-1);
        });

        Ok(ExecHandle {
            stdin_tx,
            stdout_rx,
            resize_tx,
            exit_code: exit_rx,
        })
    }

    async fn run_command(&self, container_id: &str, cmd: Vec<String>) -> Result<CommandResult> {
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("docker: create_exec")?;

        let start = self
            .client
            .start_exec(&exec.id, None)
            .await
            .context("docker: start_exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = start {
            while let Some(chunk) = output.next().await {
                match chunk.context("docker: exec output")? {
                    LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .context("docker: inspect_exec")?;

        Ok(CommandResult {
            exit_code: inspect.exit_code.unwrap_or(-1) as i32,
            stdout,
            stderr,
        })
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    async fn subscribe_events(&self) -> Result<Pin<Box<dyn Stream<Item = EngineEvent> + Send>>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start", "restart", "die", "stop", "kill"]
                .into_iter()
                .map(String::from)
                .collect(),
        );

        let stream = self.client.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }));

        let mapped = stream.filter_map(|msg| async move {
            let msg = msg.ok()?;
            let action = EventAction::from_docker_action(msg.action.as_deref()?)?;
            let container_id = msg.actor?.id?;
            Some(EngineEvent { action, container_id })
        });

        Ok(Box::pin(mapped))
    }
}

/// Docker prefixes each log line with an RFC3339 timestamp followed by a
/// space when `timestamps: true` is requested; split it back out so callers
/// get structured `{timestamp, message}` pairs instead of raw text.
fn split_docker_timestamp(line: &str) -> (String, String) {
    if line.len() > 4 && line.as_bytes()[4] == b'-' {
        if let Some(idx) = line.find(' ') {
            let (ts, rest) = line.split_at(idx);
            return (ts.to_string(), rest.trim_start().trim_end_matches('\n').to_string());
        }
    }
    (chrono::Utc::now().to_rfc3339(), line.trim_end_matches('\n').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_docker_rfc3339_prefix() {
        let (ts, msg) = split_docker_timestamp("2024-01-02T03:04:05.123456789Z listening on :8080\n");
        assert_eq!(ts, "2024-01-02T03:04:05.123456789Z");
        assert_eq!(msg, "listening on :8080");
    }

    #[test]
    fn falls_back_when_no_timestamp_present() {
        let (_, msg) = split_docker_timestamp("no timestamp here\n");
        assert_eq!(msg, "no timestamp here");
    }
}
