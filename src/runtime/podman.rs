use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use super::{
    CommandResult, ContainerInfo, ContainerRuntime, EngineEvent, EventAction, ExecConfig, ExecHandle,
    LogLine, LogStream, TtySize,
};

/// CLI-shelling fallback for environments running Podman instead of Docker.
/// Podman's REST API is Docker-compatible but not every install exposes the
/// socket, so this talks to the `podman` binary directly, the way the
/// daemon's docker counterpart talks to the Docker API.
pub struct PodmanRuntime;

impl PodmanRuntime {
    pub fn new() -> Self {
        Self
    }

    async fn run_podman(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("podman")
            .args(args)
            .output()
            .await
            .context("failed to execute podman")?;

        if !output.status.success() {
            anyhow::bail!("podman {:?} failed: {}", args, String::from_utf8_lossy(&output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct PodmanInspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "ExitCode")]
    exit_code: i64,
}

#[derive(Deserialize)]
struct PodmanInspectConfig {
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
    #[serde(rename = "ExposedPorts", default)]
    exposed_ports: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct PodmanInspectNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, PodmanInspectNetwork>,
}

#[derive(Deserialize)]
struct PodmanInspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Deserialize)]
struct PodmanInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: PodmanInspectState,
    #[serde(rename = "Config")]
    config: PodmanInspectConfig,
    #[serde(rename = "NetworkSettings")]
    network_settings: PodmanInspectNetworkSettings,
}

impl From<PodmanInspect> for ContainerInfo {
    fn from(i: PodmanInspect) -> Self {
        let exposed_ports = i
            .config
            .exposed_ports
            .keys()
            .filter_map(|p| p.split('/').next())
            .filter_map(|p| p.parse::<u16>().ok())
            .collect();
        let networks = i
            .network_settings
            .networks
            .into_iter()
            .filter(|(_, n)| !n.ip_address.is_empty())
            .map(|(name, n)| (name, n.ip_address))
            .collect();

        ContainerInfo {
            id: i.id,
            name: i.name.trim_start_matches('/').to_string(),
            state: i.state.status,
            running: i.state.running,
            exit_code: Some(i.state.exit_code),
            labels: i.config.labels,
            exposed_ports,
            networks,
            health: None,
        }
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn list_containers(&self, app: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let filter = match app {
            Some(app) => format!("label=app={app}"),
            None => "label=app".to_string(),
        };
        let output = self
            .run_podman(&["ps", "-a", "--filter", &filter, "--format", "{{.ID}}"])
            .await?;

        let mut out = Vec::new();
        for id in output.lines().filter(|l| !l.is_empty()) {
            if let Ok(info) = self.inspect(id).await {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let output = self.run_podman(&["inspect", container_id]).await?;
        let mut parsed: Vec<PodmanInspect> =
            serde_json::from_str(&output).context("podman: parse inspect json")?;
        let entry = parsed.pop().context("podman: empty inspect result")?;
        Ok(entry.into())
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.run_podman(&["start", container_id]).await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: std::time::Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let result = self.run_podman(&["stop", "-t", &secs, container_id]).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("no such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);
        let result = self.run_podman(&args).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("no such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn logs(
        &self,
        container_id: &str,
        tail: usize,
        follow: bool,
    ) -> Result<Pin<Box<dyn Stream<Item = LogLine> + Send>>> {
        let mut args = vec!["logs".to_string(), "--timestamps".to_string(), "--tail".to_string(), tail.to_string()];
        if follow {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        let mut child = Command::new("podman")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn podman logs")?;

        let stdout = child.stdout.take().context("podman logs: no stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let stream = async_stream::stream! {
            let _child = child;
            while let Ok(Some(line)) = lines.next_line().await {
                let (timestamp, message) = match line.split_once(' ') {
                    Some((ts, rest)) if ts.len() > 10 => (ts.to_string(), rest.to_string()),
                    _ => (chrono::Utc::now().to_rfc3339(), line),
                };
                yield LogLine { timestamp, message, stream: LogStream::Stdout };
            }
        };

        Ok(Box::pin(stream))
    }

    async fn exec(&self, config: &ExecConfig) -> Result<ExecHandle> {
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        if config.tty {
            args.push("-t".to_string());
        }
        args.push(config.container_id.clone());
        args.extend(config.cmd.clone());

        let mut child = Command::new("podman")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn podman exec")?;

        let mut stdin = child.stdin.take().context("podman exec: no stdin")?;
        let mut stdout = child.stdout.take().context("podman exec: no stdout")?;
        let stderr = child.stderr.take().context("podman exec: no stderr")?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(32);
        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(32);
        let (resize_tx, mut resize_rx) = mpsc::channel::<TtySize>(8);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        let stdout_tx2 = stdout_tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout_tx2.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut stderr_reader = BufReader::new(stderr);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stderr_reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            // Podman's CLI exec has no resize primitive; drain so senders don't block.
            while resize_rx.recv().await.is_some() {}
        });

        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.map(|s| s.code().unwrap_or(-1) as i64).unwrap_or(-1);
            let _ = exit_tx.send(code);
        });

        Ok(ExecHandle {
            stdin_tx,
            stdout_rx,
            resize_tx,
            exit_code: exit_rx,
        })
    }

    async fn run_command(&self, container_id: &str, cmd: Vec<String>) -> Result<CommandResult> {
        let mut args = vec!["exec".to_string(), container_id.to_string()];
        args.extend(cmd);

        let output = Command::new("podman")
            .args(&args)
            .output()
            .await
            .context("failed to execute podman exec")?;

        Ok(CommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn is_available(&self) -> bool {
        Command::new("podman")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn subscribe_events(&self) -> Result<Pin<Box<dyn Stream<Item = EngineEvent> + Send>>> {
        let mut child = Command::new("podman")
            .args(["events", "--format", "json", "--filter", "type=container"])
            .stdout(Stdio::piped())
            .spawn()
            .context("failed to spawn podman events")?;

        let stdout = child.stdout.take().context("podman events: no stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let stream = async_stream::stream! {
            let _child = child;
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else { continue };
                let Some(action) = value.get("Status").and_then(|v| v.as_str()) else { continue };
                let Some(id) = value.get("Actor")
                    .and_then(|a| a.get("ID"))
                    .and_then(|v| v.as_str()) else { continue };
                if let Some(action) = parse_podman_action(action) {
                    yield EngineEvent { action, container_id: id.to_string() };
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn parse_podman_action(action: &str) -> Option<EventAction> {
    match action {
        "start" => Some(EventAction::Start),
        "restart" => Some(EventAction::Restart),
        "died" | "die" => Some(EventAction::Die),
        "stop" => Some(EventAction::Stop),
        "kill" => Some(EventAction::Kill),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_podman_died_to_die() {
        assert_eq!(parse_podman_action("died"), Some(EventAction::Die));
        assert_eq!(parse_podman_action("exec_died"), None);
    }
}
