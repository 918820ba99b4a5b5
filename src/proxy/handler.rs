//! :80 and :443 connection handlers. :80 only ever serves ACME challenges
//! and redirects; all real traffic is terminated on :443 after TLS.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use super::{ProxyService, RouteMatch, RouteTable};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Serves ACME HTTP-01 passthrough and 301s everything else to HTTPS.
#[derive(Clone)]
pub struct Http80Handler {
    routes: Arc<RouteTable>,
    challenge_port: u16,
}

impl Http80Handler {
    pub fn new(routes: Arc<RouteTable>, challenge_port: u16) -> Self {
        Self { routes, challenge_port }
    }

    pub async fn handle_connection(&self, stream: TcpStream, remote_addr: SocketAddr) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let this = self.clone();
        http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let this = this.clone();
                    async move { this.handle_request(req, remote_addr).await }
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let path = req.uri().path();

        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return Ok(self.proxy_acme_challenge(token).await);
        }

        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let Some(host) = host else {
            debug!(%remote_addr, "request on :80 with no Host header");
            return Ok(plain_text_response(StatusCode::BAD_REQUEST, "missing Host header"));
        };

        let target_host = match self.routes.get_route(&host) {
            Some(RouteMatch::Alias(canonical)) => canonical,
            Some(RouteMatch::Canonical(entry)) => entry.canonical.clone(),
            Some(RouteMatch::Admin(_)) => host.clone(),
            None => {
                return Ok(plain_text_response(StatusCode::NOT_FOUND, "no application registered for this host"));
            }
        };

        let location = format!("https://{target_host}{}", req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));
        Ok(Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(hyper::header::LOCATION, location)
            .body(Empty::new().map_err(|never| match never {}).boxed())
            .expect("static redirect response is well-formed"))
    }

    /// Relays the HTTP-01 token request to the loopback challenge
    /// responder, which is the only thing that actually knows the key
    /// authorization (spec §4.8).
    async fn proxy_acme_challenge(&self, token: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let url = format!("http://127.0.0.1:{}/.well-known/acme-challenge/{token}", self.challenge_port);
        match reqwest::get(&url).await {
            Ok(resp) => {
                let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
                let body = resp.text().await.unwrap_or_default();
                Response::builder()
                    .status(status)
                    .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                    .expect("challenge response is well-formed")
            }
            Err(e) => {
                warn!(error = %e, "failed to reach ACME challenge responder");
                plain_text_response(StatusCode::BAD_GATEWAY, "challenge responder unreachable")
            }
        }
    }
}

/// Terminates TLS (handled by the caller's acceptor) and forwards to a
/// backend, or redirects an alias to its canonical domain.
#[derive(Clone)]
pub struct Https443Handler {
    routes: Arc<RouteTable>,
    service: ProxyService,
}

impl Https443Handler {
    pub fn new(routes: Arc<RouteTable>) -> Self {
        Self { routes, service: ProxyService::new() }
    }

    pub async fn handle_connection<IO>(&self, io: IO, remote_addr: SocketAddr) -> anyhow::Result<()>
    where
        IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let this = self.clone();
        hyper::server::conn::http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let this = this.clone();
                    async move { this.handle_request(req, remote_addr).await }
                }),
            )
            .with_upgrades()
            .await?;
        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let Some(host) = host else {
            return Ok(plain_text_response(StatusCode::BAD_REQUEST, "missing Host header"));
        };

        let backend = match self.routes.get_route(&host) {
            Some(RouteMatch::Alias(canonical)) => {
                let location = format!("https://{canonical}{}", req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));
                return Ok(Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(hyper::header::LOCATION, location)
                    .body(Empty::new().map_err(|never| match never {}).boxed())
                    .expect("static redirect response is well-formed"));
            }
            Some(RouteMatch::Canonical(entry)) => match entry.next_backend() {
                Some(backend) => backend,
                None => {
                    warn!(app = %entry.app, "route has no healthy backends");
                    return Ok(plain_text_response(StatusCode::SERVICE_UNAVAILABLE, "no healthy backend for this application"));
                }
            },
            Some(RouteMatch::Admin(backend)) => backend,
            None => {
                return Ok(plain_text_response(StatusCode::NOT_FOUND, "no application registered for this host"));
            }
        };

        let result = if ProxyService::is_websocket_upgrade(&req) {
            self.service.tunnel_websocket(req, &backend).await
        } else {
            self.service.forward(req, &backend).await
        };

        match result {
            Ok(resp) => Ok(resp),
            Err(e) => {
                error!(error = %e, backend = %backend.addr(), %remote_addr, "backend request failed");
                Ok(plain_text_response(StatusCode::BAD_GATEWAY, "backend unavailable"))
            }
        }
    }
}

fn plain_text_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())).map_err(|never| match never {}).boxed())
        .expect("static error response is well-formed")
}
