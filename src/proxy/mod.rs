//! Reverse proxy (C10): domain-keyed route table plus the :80 (ACME +
//! redirect) and :443 (TLS-terminated forwarding) listeners.

mod handler;
mod service;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{error, info};

pub use handler::{Http80Handler, Https443Handler};
pub use service::ProxyService;

use crate::cert::CertLoader;
use crate::deploy::Discovery;

/// One app replica this proxy can forward to.
#[derive(Debug, Clone)]
pub struct Backend {
    pub container_id: String,
    pub ip: String,
    pub port: u16,
}

impl Backend {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A canonical domain's routing entry: its backends (round-robin) and the
/// aliases that should 301 to it. `backends` is the full set committed by
/// the last reconciliation pass; `active` is the subset the health monitor
/// currently considers healthy and is the only field it is ever allowed to
/// shrink (spec §5: "the monitor's writes may only remove unhealthy
/// backends from existing routes" — it can never add one `backends` itself
/// didn't already contain).
pub struct RouteEntry {
    pub app: String,
    pub canonical: String,
    pub aliases: Vec<String>,
    pub backends: Vec<Backend>,
    active: RwLock<Vec<Backend>>,
    next: AtomicUsize,
}

impl RouteEntry {
    pub fn next_backend(&self) -> Option<Backend> {
        let active = self.active.read();
        if active.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % active.len();
        active.get(i).cloned()
    }
}

enum RouteKind {
    Canonical(Arc<RouteEntry>),
    Alias(String),
}

#[derive(Clone)]
pub enum RouteMatch {
    /// Route directly to a backend of this canonical entry.
    Canonical(Arc<RouteEntry>),
    /// Redirect to this canonical domain.
    Alias(String),
    /// The admin API's own domain (spec §4.6/§4.10: reachable by host match
    /// alongside routed app traffic).
    Admin(Backend),
}

/// Thread-safe route table: domain -> canonical entry or alias pointer.
/// Rebuilt wholesale on every reconciliation pass (spec §4.10: "routing
/// state is a pure function of the last committed discovery"). The admin
/// route is set once at startup and is not touched by rebuilds.
#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<String, RouteKind>,
    admin_route: RwLock<Option<(String, Backend)>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the admin API's domain, routed straight to its loopback
    /// listener regardless of what discovery produces.
    pub fn set_admin_route(&self, domain: &str, backend: Backend) {
        *self.admin_route.write() = Some((domain.to_lowercase(), backend));
    }

    pub fn get_route(&self, domain: &str) -> Option<RouteMatch> {
        let domain = domain.split(':').next().unwrap_or(domain).to_lowercase();
        if let Some((admin_domain, backend)) = self.admin_route.read().as_ref() {
            if *admin_domain == domain {
                return Some(RouteMatch::Admin(backend.clone()));
            }
        }
        match self.routes.get(&domain)?.value() {
            RouteKind::Canonical(entry) => Some(RouteMatch::Canonical(entry.clone())),
            RouteKind::Alias(canonical) => Some(RouteMatch::Alias(canonical.clone())),
        }
    }

    pub fn domains(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.key().clone()).collect()
    }

    /// Replaces the entire route table from a committed discovery pass.
    /// Domains absent from `discovery` are dropped; this is intentionally a
    /// full rebuild rather than an incremental diff, since an app can gain
    /// or lose domain groups between deploys and reconstructing from
    /// scratch avoids an entire class of stale-alias bugs. Every backend
    /// starts active — the health monitor narrows from here on its own
    /// ticks, matching the tracker's "new targets start healthy" rule.
    pub fn replace_from_discovery(&self, discovery: &Discovery) {
        let fresh = DashMap::new();

        for (app, replicas) in &discovery.apps {
            let Some(first) = replicas.first() else { continue };
            let backends: Vec<Backend> = replicas
                .iter()
                .map(|r| Backend {
                    container_id: r.container_id.clone(),
                    ip: r.ip.clone(),
                    port: r.labels.port.parse().unwrap_or(0),
                })
                .collect();

            for group in &first.labels.domains {
                let canonical = group.canonical.to_lowercase();
                let entry = Arc::new(RouteEntry {
                    app: app.clone(),
                    canonical: canonical.clone(),
                    aliases: group.aliases.iter().map(|a| a.to_lowercase()).collect(),
                    active: RwLock::new(backends.clone()),
                    backends: backends.clone(),
                    next: AtomicUsize::new(0),
                });
                fresh.insert(canonical.clone(), RouteKind::Canonical(entry));
                for alias in &group.aliases {
                    fresh.insert(alias.to_lowercase(), RouteKind::Alias(canonical.clone()));
                }
            }
        }

        self.routes.clear();
        for (k, v) in fresh {
            self.routes.insert(k, v);
        }
        info!(domains = self.routes.len(), "route table rebuilt");
    }

    /// Narrows every canonical entry's active backend set to the
    /// intersection with `healthy_ids`. Never adds a backend beyond what
    /// `backends` already holds — the health monitor can only remove.
    pub fn narrow_to_healthy(&self, healthy_ids: &HashSet<String>) {
        for entry in self.routes.iter() {
            if let RouteKind::Canonical(route) = entry.value() {
                let narrowed: Vec<Backend> =
                    route.backends.iter().filter(|b| healthy_ids.contains(&b.container_id)).cloned().collect();
                *route.active.write() = narrowed;
            }
        }
    }
}

/// Owns both public listeners: :80 (ACME passthrough + redirect-to-HTTPS)
/// and :443 (TLS termination via `cert_loader`'s SNI resolver, then
/// forwarding).
pub struct ProxyServer {
    routes: Arc<RouteTable>,
    cert_loader: Arc<CertLoader>,
    http_port: u16,
    https_port: u16,
    challenge_port: u16,
}

impl ProxyServer {
    pub fn new(routes: Arc<RouteTable>, cert_loader: Arc<CertLoader>, http_port: u16, https_port: u16, challenge_port: u16) -> Self {
        Self { routes, cert_loader, http_port, https_port, challenge_port }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let http_routes = self.routes.clone();
        let http_port = self.http_port;
        let challenge_port = self.challenge_port;
        let http_task = tokio::spawn(async move {
            if let Err(e) = run_http80(http_routes, http_port, challenge_port).await {
                error!(error = %e, "HTTP listener exited");
            }
        });

        let https_task = tokio::spawn(async move {
            if let Err(e) = run_https443(self.routes, self.cert_loader, self.https_port).await {
                error!(error = %e, "HTTPS listener exited");
            }
        });

        let _ = tokio::join!(http_task, https_task);
        Ok(())
    }
}

async fn run_http80(routes: Arc<RouteTable>, port: u16, challenge_port: u16) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP listener ready");
    let handler = Http80Handler::new(routes, challenge_port);

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle_connection(stream, remote_addr).await {
                tracing::debug!(error = %e, "HTTP connection ended");
            }
        });
    }
}

async fn run_https443(routes: Arc<RouteTable>, cert_loader: Arc<CertLoader>, port: u16) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTPS listener ready");

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_loader);
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let handler = Https443Handler::new(routes);

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    if let Err(e) = handler.handle_connection(io, remote_addr).await {
                        tracing::debug!(error = %e, "HTTPS connection ended");
                    }
                }
                Err(e) => tracing::debug!(error = %e, %remote_addr, "TLS handshake failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::deploy::Replica;
    use std::collections::HashMap;

    fn labels(domains: &str) -> Labels {
        let mut m = HashMap::new();
        m.insert("app".to_string(), "web".to_string());
        m.insert("deployment_id".to_string(), "1".to_string());
        m.insert("port".to_string(), "8080".to_string());
        m.insert("health_path".to_string(), "/healthz".to_string());
        m.insert("domains".to_string(), domains.to_string());
        Labels::parse(&m).unwrap()
    }

    #[test]
    fn alias_resolves_to_canonical() {
        let table = RouteTable::new();
        let mut discovery = Discovery::default();
        discovery.apps.insert(
            "web".to_string(),
            vec![Replica { container_id: "c1".to_string(), ip: "10.0.0.1".to_string(), labels: labels("x.test,www.x.test") }],
        );
        table.replace_from_discovery(&discovery);

        match table.get_route("www.x.test") {
            Some(RouteMatch::Alias(canonical)) => assert_eq!(canonical, "x.test"),
            other => panic!("expected alias route, got {:?}", other.is_some()),
        }
        assert!(matches!(table.get_route("x.test"), Some(RouteMatch::Canonical(_))));
    }

    #[test]
    fn round_robin_cycles_backends() {
        let table = RouteTable::new();
        let mut discovery = Discovery::default();
        discovery.apps.insert(
            "web".to_string(),
            vec![
                Replica { container_id: "c1".to_string(), ip: "10.0.0.1".to_string(), labels: labels("x.test") },
                Replica { container_id: "c2".to_string(), ip: "10.0.0.2".to_string(), labels: labels("x.test") },
            ],
        );
        table.replace_from_discovery(&discovery);

        let Some(RouteMatch::Canonical(entry)) = table.get_route("x.test") else { panic!("no route") };
        let first = entry.next_backend().unwrap().ip.clone();
        let second = entry.next_backend().unwrap().ip.clone();
        let third = entry.next_backend().unwrap().ip.clone();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn rebuild_drops_stale_domains() {
        let table = RouteTable::new();
        let mut discovery = Discovery::default();
        discovery.apps.insert("web".to_string(), vec![Replica { container_id: "c1".to_string(), ip: "10.0.0.1".to_string(), labels: labels("x.test") }]);
        table.replace_from_discovery(&discovery);
        assert!(table.get_route("x.test").is_some());

        table.replace_from_discovery(&Discovery::default());
        assert!(table.get_route("x.test").is_none());
    }
}
