//! Deployment manager (C6): turns the running container set into the
//! routing and health-check configuration the rest of the system needs —
//! discover, startup-check, commit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cert::DomainGroupKey;
use crate::health::{HealthChecker, RetryConfig, Target};
use crate::labels::{LabelError, Labels};
use crate::runtime::{ContainerInfo, ContainerRuntime};

/// One discovered, label-parsed app replica.
#[derive(Debug, Clone)]
pub struct Replica {
    pub container_id: String,
    pub ip: String,
    pub labels: Labels,
}

/// The result of a discovery pass: replicas grouped by app name, plus any
/// containers whose labels failed to parse (reported, never fatal).
///
/// `apps` holds only the winning deployment per app (spec §3, §4.6: "the
/// containers with the greatest `deployment_id` form the current set");
/// `superseded` holds everything else discovered for that app, kept around
/// so the reconciler can retire it (stop+remove) rather than silently
/// dropping it from view.
#[derive(Debug, Default)]
pub struct Discovery {
    pub apps: HashMap<String, Vec<Replica>>,
    pub superseded: HashMap<String, Vec<Replica>>,
    pub rejected: Vec<(String, LabelError)>,
}

pub struct DeploymentManager {
    runtime: Arc<dyn ContainerRuntime>,
    checker: Arc<HealthChecker>,
    retry: RetryConfig,
}

impl DeploymentManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, checker: Arc<HealthChecker>, retry: RetryConfig) -> Self {
        Self { runtime, checker, retry }
    }

    /// Lists every running container, parses its labels, and groups valid
    /// ones by app name. A container with malformed labels is excluded and
    /// reported rather than aborting discovery for the whole host (spec
    /// §4.2).
    pub async fn discover(&self) -> anyhow::Result<Discovery> {
        let containers = self.runtime.list_containers(None).await?;
        let mut discovery = Discovery::default();

        for container in containers {
            if !container.running {
                continue;
            }
            match Labels::parse(&container.labels) {
                Ok(labels) => {
                    if !labels.port_matches(&container.exposed_ports) {
                        discovery.rejected.push((
                            container.id.clone(),
                            LabelError {
                                field: "port",
                                reason: "declared port not among container's exposed ports".to_string(),
                            },
                        ));
                        continue;
                    }
                    let Some(ip) = primary_ip(&container) else {
                        discovery.rejected.push((
                            container.id.clone(),
                            LabelError {
                                field: "network",
                                reason: "container has no attached network address".to_string(),
                            },
                        ));
                        continue;
                    };
                    discovery.apps.entry(labels.app.clone()).or_default().push(Replica {
                        container_id: container.id,
                        ip,
                        labels,
                    });
                }
                Err(e) => discovery.rejected.push((container.id, e)),
            }
        }

        if !discovery.rejected.is_empty() {
            warn!(count = discovery.rejected.len(), "containers excluded from discovery due to label errors");
        }

        for (app, replicas) in discovery.apps.iter_mut() {
            let losers = select_winning_deployment(replicas);
            if !losers.is_empty() {
                info!(
                    app = %app,
                    winner = %replicas.first().map(|r| r.labels.deployment_id.as_str()).unwrap_or(""),
                    superseded = losers.len(),
                    "superseded deployment replicas excluded from routing"
                );
                discovery.superseded.insert(app.clone(), losers);
            }
        }

        Ok(discovery)
    }

    /// Probes every replica of a freshly discovered (or redeployed) app
    /// before it is allowed into the route table, with retry (spec §4.6:
    /// "no replica joins rotation unhealthy"). Returns the subset that
    /// passed.
    pub async fn startup_check(&self, replicas: &[Replica]) -> Vec<Replica> {
        let mut healthy = Vec::new();
        let cancel = tokio_util::sync::CancellationToken::new();
        for replica in replicas {
            let target = replica_target(replica);
            let result = self.checker.check_with_retry(&target, self.retry, &cancel, None).await;
            if result.healthy {
                healthy.push(replica.clone());
            } else {
                warn!(
                    container = %replica.container_id,
                    app = %replica.labels.app,
                    error = ?result.error,
                    "replica failed startup health check, excluded from rotation"
                );
            }
        }

        if healthy.is_empty() && !replicas.is_empty() {
            warn!(app = %replicas[0].labels.app, "all replicas failed startup check");
        } else if healthy.len() < replicas.len() {
            warn!(
                app = %replicas[0].labels.app,
                healthy = healthy.len(),
                total = replicas.len(),
                "partial replica failure during startup check"
            );
        }

        healthy
    }

    /// Converts a discovery pass into health-monitor targets, keyed by
    /// container id, for every app's healthy-at-startup replicas.
    pub fn commit(&self, discovery: &Discovery) -> Vec<Target> {
        discovery
            .apps
            .values()
            .flatten()
            .map(replica_target)
            .collect()
    }

    /// Domain groups across every discovered app, deduplicated by
    /// canonical name, for the certificate manager to ensure coverage for.
    pub fn certificate_domains(&self, discovery: &Discovery) -> Vec<DomainGroupKey> {
        let mut seen = std::collections::HashSet::new();
        let mut groups = Vec::new();
        for replicas in discovery.apps.values() {
            let Some(replica) = replicas.first() else { continue };
            for group in &replica.labels.domains {
                let canonical = group.canonical.to_lowercase();
                if !seen.insert(canonical.clone()) {
                    continue;
                }
                let mut all = vec![canonical.clone()];
                all.extend(group.aliases.iter().map(|a| a.to_lowercase()));
                groups.push(DomainGroupKey { canonical, all });
            }
        }
        groups
    }
}

fn replica_target(replica: &Replica) -> Target {
    Target {
        id: replica.container_id.clone(),
        app: replica.labels.app.clone(),
        ip: replica.ip.clone(),
        port: replica.labels.port.parse().unwrap_or(0),
        health_path: replica.labels.health_path.clone(),
    }
}

fn primary_ip(container: &ContainerInfo) -> Option<String> {
    container.networks.values().next().cloned()
}

/// Keeps only the replicas carrying the lexicographic-maximum
/// `deployment_id` (union on ties), returning the rest. This is the core
/// cutover invariant: an old and a new generation of the same app must
/// never both receive traffic.
fn select_winning_deployment(replicas: &mut Vec<Replica>) -> Vec<Replica> {
    let Some(winner) = replicas.iter().map(|r| r.labels.deployment_id.clone()).max() else {
        return Vec::new();
    };
    let (keep, drop): (Vec<_>, Vec<_>) = replicas.drain(..).partition(|r| r.labels.deployment_id == winner);
    *replicas = keep;
    drop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::NoopRuntime;
    use std::time::Duration;

    fn checker() -> Arc<HealthChecker> {
        Arc::new(HealthChecker::new(Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn discover_on_empty_runtime_yields_nothing() {
        let manager = DeploymentManager::new(Arc::new(NoopRuntime), checker(), RetryConfig::default());
        let discovery = manager.discover().await.unwrap();
        assert!(discovery.apps.is_empty());
        assert!(discovery.rejected.is_empty());
    }

    #[tokio::test]
    async fn startup_check_excludes_unreachable_replicas() {
        let manager = DeploymentManager::new(
            Arc::new(NoopRuntime),
            checker(),
            RetryConfig { max_retries: 0, initial_backoff: Duration::from_millis(1), max_backoff: Duration::from_millis(1) },
        );
        let mut labels_map = HashMap::new();
        labels_map.insert("app".to_string(), "web".to_string());
        labels_map.insert("deployment_id".to_string(), "1".to_string());
        labels_map.insert("port".to_string(), "1".to_string());
        labels_map.insert("health_path".to_string(), "/healthz".to_string());
        labels_map.insert("domains".to_string(), "x.test".to_string());
        let labels = Labels::parse(&labels_map).unwrap();

        let replica = Replica {
            container_id: "c1".to_string(),
            ip: "127.0.0.1".to_string(),
            labels,
        };
        let healthy = manager.startup_check(&[replica]).await;
        assert!(healthy.is_empty());
    }

    fn labels_with_deployment(deployment_id: &str) -> Labels {
        let mut m = HashMap::new();
        m.insert("app".to_string(), "web".to_string());
        m.insert("deployment_id".to_string(), deployment_id.to_string());
        m.insert("port".to_string(), "8080".to_string());
        m.insert("health_path".to_string(), "/healthz".to_string());
        m.insert("domains".to_string(), "x.test".to_string());
        Labels::parse(&m).unwrap()
    }

    #[test]
    fn select_winning_deployment_keeps_only_lexicographic_max() {
        let mut replicas = vec![
            Replica { container_id: "old".to_string(), ip: "10.0.0.1".to_string(), labels: labels_with_deployment("d1") },
            Replica { container_id: "new".to_string(), ip: "10.0.0.2".to_string(), labels: labels_with_deployment("d2") },
        ];
        let superseded = select_winning_deployment(&mut replicas);
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].container_id, "new");
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].container_id, "old");
    }

    #[test]
    fn select_winning_deployment_unions_replicas_on_tie() {
        let mut replicas = vec![
            Replica { container_id: "c1".to_string(), ip: "10.0.0.1".to_string(), labels: labels_with_deployment("d2") },
            Replica { container_id: "c2".to_string(), ip: "10.0.0.2".to_string(), labels: labels_with_deployment("d2") },
        ];
        let superseded = select_winning_deployment(&mut replicas);
        assert_eq!(replicas.len(), 2);
        assert!(superseded.is_empty());
    }

    #[test]
    fn certificate_domains_deduplicates_canonicals() {
        let manager = DeploymentManager::new(Arc::new(NoopRuntime), checker(), RetryConfig::default());
        let mut labels_map = HashMap::new();
        labels_map.insert("app".to_string(), "web".to_string());
        labels_map.insert("deployment_id".to_string(), "1".to_string());
        labels_map.insert("port".to_string(), "8080".to_string());
        labels_map.insert("health_path".to_string(), "/healthz".to_string());
        labels_map.insert("domains".to_string(), "x.test,www.x.test".to_string());
        let labels = Labels::parse(&labels_map).unwrap();

        let mut discovery = Discovery::default();
        discovery.apps.insert(
            "web".to_string(),
            vec![
                Replica { container_id: "c1".to_string(), ip: "10.0.0.1".to_string(), labels: labels.clone() },
                Replica { container_id: "c2".to_string(), ip: "10.0.0.2".to_string(), labels },
            ],
        );

        let groups = manager.certificate_domains(&discovery);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].canonical, "x.test");
        assert_eq!(groups[0].all, vec!["x.test".to_string(), "www.x.test".to_string()]);
    }
}
