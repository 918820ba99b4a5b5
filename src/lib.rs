pub mod api;
pub mod cert;
pub mod config;
pub mod deploy;
pub mod health;
pub mod labels;
pub mod proxy;
pub mod reconcile;
pub mod runtime;
pub mod util;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::api::daemonlog::DaemonLogBroadcaster;
use crate::cert::CertManager;
use crate::config::Config;
use crate::deploy::DeploymentManager;
use crate::health::{HealthMonitor, SharedTargets};
use crate::proxy::RouteTable;
use crate::runtime::ContainerRuntime;

/// Everything the admin API needs to answer a request. Long-lived
/// subsystem handles built once at startup and shared read-only from here
/// on — no process-wide singletons (spec §9's "Global mutable state" note).
pub struct AppState {
    pub config: Config,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub deploy: Arc<DeploymentManager>,
    pub certs: Arc<CertManager>,
    pub routes: Arc<RouteTable>,
    pub health: Arc<HealthMonitor>,
    pub targets: Arc<SharedTargets>,
    pub daemon_log: Arc<DaemonLogBroadcaster>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        deploy: Arc<DeploymentManager>,
        certs: Arc<CertManager>,
        routes: Arc<RouteTable>,
        health: Arc<HealthMonitor>,
        targets: Arc<SharedTargets>,
        daemon_log: Arc<DaemonLogBroadcaster>,
    ) -> Self {
        Self {
            config,
            runtime,
            deploy,
            certs,
            routes,
            health,
            targets,
            daemon_log,
            metrics_handle: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
