//! Reconciler (C11): the component that ties discovery, health, certs, and
//! routing together. Triggered on startup, on an app-changed engine event
//! (debounced per app), and periodically as a safety net.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cert::{CertManager, DomainGroupKey};
use crate::deploy::{DeploymentManager, Replica};
use crate::health::{HealthMonitor, SharedTargets};
use crate::labels::Labels;
use crate::proxy::RouteTable;
use crate::runtime::{ContainerRuntime, EventAction};
use crate::util::Debouncer;

/// What the triggering engine event was about, resolved from the
/// container's own labels so the reconciler can scope both certificate
/// re-issue and superseded-container retirement to the right app instead
/// of sweeping every app on every event.
#[derive(Debug, Clone)]
pub struct AppEvent {
    pub app: String,
    pub domains: Vec<DomainGroupKey>,
    pub deployment_id: String,
    pub last_action: EventAction,
}

#[derive(Debug, Clone)]
pub enum TriggerReason {
    Initial,
    /// `None` when the triggering container could no longer be inspected
    /// (already removed) — treated as an unscoped event, same as `Initial`.
    AppUpdated(Option<AppEvent>),
    PeriodicRefresh,
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    deploy: Arc<DeploymentManager>,
    certs: Arc<CertManager>,
    routes: Arc<RouteTable>,
    health: Arc<HealthMonitor>,
    targets: Arc<SharedTargets>,
    debouncer: Debouncer,
    periodic_interval: Duration,
    api_domain: Option<String>,
}

/// Bound on how long retirement waits for a superseded container to stop
/// before forcing removal anyway.
const RETIREMENT_DEADLINE: Duration = Duration::from_secs(600);
const RETIREMENT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RETIREMENT_GRACE: Duration = Duration::from_secs(10);

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        deploy: Arc<DeploymentManager>,
        certs: Arc<CertManager>,
        routes: Arc<RouteTable>,
        health: Arc<HealthMonitor>,
        targets: Arc<SharedTargets>,
        event_debounce: Duration,
        periodic_interval: Duration,
        api_domain: Option<String>,
    ) -> Self {
        Self {
            runtime,
            deploy,
            certs,
            routes,
            health,
            targets,
            debouncer: Debouncer::new(event_debounce),
            periodic_interval,
            api_domain,
        }
    }

    /// Runs the reconciliation sequence once: discover, startup checks for
    /// newly-seen replicas, ensure certificates, swap routes, commit health
    /// targets, force an immediate health pass, and retire any containers
    /// superseded by a newer deployment.
    pub async fn reconcile_once(&self, reason: TriggerReason) {
        info!(?reason, "reconciling");

        let discovery = match self.deploy.discover().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "discovery failed, skipping this reconciliation pass");
                return;
            }
        };

        for (id, err) in &discovery.rejected {
            warn!(container = %id, error = %err, "container excluded from reconciliation");
        }

        let mut accepted = std::collections::HashMap::new();
        for (app, replicas) in &discovery.apps {
            let healthy = self.deploy.startup_check(replicas).await;
            if healthy.len() < replicas.len() {
                warn!(
                    app = %app,
                    healthy = healthy.len(),
                    total = replicas.len(),
                    "partial replica failure, proceeding with healthy subset"
                );
            }
            if !healthy.is_empty() {
                accepted.insert(app.clone(), healthy);
            } else {
                warn!(app = %app, "app has zero healthy replicas, removing its routes");
            }
        }

        let mut filtered_discovery = crate::deploy::Discovery::default();
        filtered_discovery.apps = accepted;
        filtered_discovery.superseded = discovery.superseded.clone();

        let mut groups = self.deploy.certificate_domains(&filtered_discovery);
        if let Some(domain) = &self.api_domain {
            if !groups.iter().any(|g| g.canonical == *domain) {
                groups.push(DomainGroupKey { canonical: domain.clone(), all: vec![domain.clone()] });
            }
        }

        // Boot and a known single app's update get a synchronous, scoped
        // re-issue so the cert is ready before routes flip to it; every
        // pass also feeds the full group list to the debounced refresh as
        // a safety net.
        let sync_groups: Vec<DomainGroupKey> = match &reason {
            TriggerReason::Initial => groups.clone(),
            TriggerReason::AppUpdated(Some(event)) => {
                groups.iter().filter(|g| event.domains.iter().any(|d| d.canonical == g.canonical)).cloned().collect()
            }
            _ => Vec::new(),
        };
        if !sync_groups.is_empty() {
            if let Err(e) = self.certs.refresh_sync(&sync_groups).await {
                warn!(error = %e, ?reason, "synchronous certificate issuance failed");
            }
        }
        self.certs.refresh(groups).await;
        if matches!(reason, TriggerReason::PeriodicRefresh) {
            self.certs.cleanup_expired();
        }

        self.routes.replace_from_discovery(&filtered_discovery);

        let targets = self.deploy.commit(&filtered_discovery);
        info!(target_count = targets.len(), "committing health targets");
        self.targets.set(targets);
        self.health.force_check();

        self.retire_superseded(&reason, &filtered_discovery.superseded);

        info!(?reason, apps = filtered_discovery.apps.len(), "reconciliation complete");
    }

    /// Spawns bounded stop+remove tasks for containers a newer deployment
    /// has superseded. Scoped to the triggering app when known; otherwise
    /// (startup, periodic sweep, an event whose container already vanished)
    /// every app's superseded set is retired. Runs detached from
    /// `reconcile_once` so a slow-to-stop container never holds up the next
    /// reconciliation pass.
    fn retire_superseded(&self, reason: &TriggerReason, superseded: &std::collections::HashMap<String, Vec<Replica>>) {
        let to_retire: Vec<(String, Vec<Replica>)> = match reason {
            TriggerReason::AppUpdated(Some(event)) => superseded
                .get(&event.app)
                .map(|replicas| vec![(event.app.clone(), replicas.clone())])
                .unwrap_or_default(),
            _ => superseded.iter().map(|(app, replicas)| (app.clone(), replicas.clone())).collect(),
        };

        for (app, replicas) in to_retire {
            for replica in replicas {
                let runtime = self.runtime.clone();
                tokio::spawn(async move {
                    stop_and_remove(runtime.as_ref(), &replica.container_id, &app).await;
                });
            }
        }
    }

    /// Inspects the triggering container and parses its labels so the
    /// reconciler can scope this pass to one app. Returns `None` if the
    /// container already vanished or its labels no longer parse — both
    /// treated by the caller as an unscoped event.
    async fn resolve_app_event(&self, container_id: &str, action: EventAction) -> Option<AppEvent> {
        let info = self.runtime.inspect(container_id).await.ok()?;
        let labels = Labels::parse(&info.labels).ok()?;
        let domains = labels
            .domains
            .iter()
            .map(|group| {
                let canonical = group.canonical.to_lowercase();
                let mut all = vec![canonical.clone()];
                all.extend(group.aliases.iter().map(|a| a.to_lowercase()));
                DomainGroupKey { canonical, all }
            })
            .collect();
        Some(AppEvent { app: labels.app, domains, deployment_id: labels.deployment_id, last_action: action })
    }

    /// Runs forever: an immediate initial pass, then reacts to engine
    /// events (debounced per app) and a periodic safety-net pass.
    pub async fn run(self: Arc<Self>) {
        self.reconcile_once(TriggerReason::Initial).await;

        let this = self.clone();
        let events_task = async move {
            match this.runtime.subscribe_events().await {
                Ok(mut stream) => {
                    use futures::StreamExt;
                    while let Some(event) = stream.next().await {
                        if matches!(
                            event.action,
                            EventAction::Start | EventAction::Restart | EventAction::Die | EventAction::Stop | EventAction::Kill
                        ) {
                            let app_event = this.resolve_app_event(&event.container_id, event.action).await;
                            let key = app_event.as_ref().map(|e| e.app.clone()).unwrap_or_else(|| "reconcile".to_string());
                            let this = this.clone();
                            this.debouncer
                                .trigger(key, move || async move {
                                    this.reconcile_once(TriggerReason::AppUpdated(app_event)).await;
                                })
                                .await;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "engine event subscription unavailable, relying on periodic reconciliation only"),
            }
        };

        let this = self.clone();
        let periodic_task = async move {
            let mut ticker = tokio::time::interval(this.periodic_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.reconcile_once(TriggerReason::PeriodicRefresh).await;
            }
        };

        tokio::join!(events_task, periodic_task);
    }
}

/// Stops `container_id` with a grace period, polls until it is no longer
/// running (or `RETIREMENT_DEADLINE` elapses, at which point removal is
/// forced anyway), then removes it. An inspect `Err` at any point is
/// treated as "already gone" rather than a failure.
async fn stop_and_remove(runtime: &dyn ContainerRuntime, container_id: &str, app: &str) {
    if let Err(e) = runtime.stop(container_id, RETIREMENT_GRACE).await {
        warn!(container = %container_id, app = %app, error = %e, "failed to stop superseded container");
    }

    let deadline = tokio::time::Instant::now() + RETIREMENT_DEADLINE;
    loop {
        match runtime.inspect(container_id).await {
            Ok(info) if info.running => {
                if tokio::time::Instant::now() >= deadline {
                    warn!(container = %container_id, app = %app, "superseded container did not stop within the bound, forcing removal");
                    break;
                }
                tokio::time::sleep(RETIREMENT_POLL_INTERVAL).await;
            }
            Ok(_) => break,
            Err(_) => return,
        }
    }

    match runtime.remove(container_id, true).await {
        Ok(()) => info!(container = %container_id, app = %app, "retired superseded container"),
        Err(e) => warn!(container = %container_id, app = %app, error = %e, "failed to remove superseded container"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CommandResult, ContainerInfo, EngineEvent, ExecConfig, ExecHandle, LogLine};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records stop/remove calls and reports a container as already gone on
    /// inspect, so `stop_and_remove` completes without blocking on the
    /// (unused in these tests) poll loop.
    struct RecordingRuntime {
        stopped: Mutex<Vec<String>>,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn list_containers(&self, _app: Option<&str>) -> anyhow::Result<Vec<ContainerInfo>> {
            Ok(Vec::new())
        }
        async fn inspect(&self, _container_id: &str) -> anyhow::Result<ContainerInfo> {
            anyhow::bail!("gone")
        }
        async fn start(&self, _container_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self, container_id: &str, _grace: Duration) -> anyhow::Result<()> {
            self.stopped.lock().unwrap().push(container_id.to_string());
            Ok(())
        }
        async fn remove(&self, _container_id: &str, _force: bool) -> anyhow::Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn logs(&self, _container_id: &str, _tail: usize, _follow: bool) -> anyhow::Result<std::pin::Pin<Box<dyn futures::Stream<Item = LogLine> + Send>>> {
            anyhow::bail!("unsupported")
        }
        async fn exec(&self, _config: &ExecConfig) -> anyhow::Result<ExecHandle> {
            anyhow::bail!("unsupported")
        }
        async fn run_command(&self, _container_id: &str, _cmd: Vec<String>) -> anyhow::Result<CommandResult> {
            anyhow::bail!("unsupported")
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn subscribe_events(&self) -> anyhow::Result<std::pin::Pin<Box<dyn futures::Stream<Item = EngineEvent> + Send>>> {
            anyhow::bail!("unsupported")
        }
    }

    #[tokio::test]
    async fn stop_and_remove_stops_then_removes_when_already_gone() {
        let runtime = RecordingRuntime { stopped: Mutex::new(Vec::new()), removed: AtomicUsize::new(0) };
        stop_and_remove(&runtime, "c1", "web").await;
        assert_eq!(runtime.stopped.lock().unwrap().as_slice(), ["c1".to_string()]);
        assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
    }

    fn labels_map(app: &str, deployment_id: &str) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("app".to_string(), app.to_string());
        m.insert("deployment_id".to_string(), deployment_id.to_string());
        m.insert("port".to_string(), "8080".to_string());
        m.insert("health_path".to_string(), "/healthz".to_string());
        m.insert("domains".to_string(), "x.test".to_string());
        m
    }

    #[test]
    fn app_event_carries_deployment_id_and_domains() {
        let labels = Labels::parse(&labels_map("web", "d2")).unwrap();
        let domains: Vec<DomainGroupKey> = labels
            .domains
            .iter()
            .map(|g| DomainGroupKey { canonical: g.canonical.clone(), all: vec![g.canonical.clone()] })
            .collect();
        let event = AppEvent { app: labels.app.clone(), domains, deployment_id: labels.deployment_id.clone(), last_action: EventAction::Start };
        assert_eq!(event.app, "web");
        assert_eq!(event.deployment_id, "d2");
        assert_eq!(event.domains[0].canonical, "x.test");
    }
}
