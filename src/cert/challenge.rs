//! ACME challenge responder (C8): a tiny loopback-only HTTP server that
//! answers `GET /.well-known/acme-challenge/{token}` independent of the
//! main reverse proxy, so a challenge can be served even before any domain
//! has a route (first-ever certificate on a fresh host).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use super::acme::AcmeChallenges;

pub struct ChallengeResponder {
    port: u16,
    challenges: AcmeChallenges,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChallengeResponder {
    pub fn new(port: u16, challenges: AcmeChallenges) -> Arc<Self> {
        Arc::new(Self {
            port,
            challenges,
            handle: parking_lot::Mutex::new(None),
        })
    }

    /// Binds to `127.0.0.1:{port}` only — this server is never reachable
    /// directly from the internet; the public-facing proxy on :80 forwards
    /// `/.well-known/acme-challenge/*` requests here (spec §4.8).
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port);
        let listener = TcpListener::bind(addr).await?;
        let app = Router::new()
            .route("/.well-known/acme-challenge/:token", get(respond))
            .with_state(self.challenges.clone());

        info!(%addr, "ACME challenge responder listening");
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "ACME challenge responder exited");
            }
        });
        *self.handle.lock() = Some(task);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(task) = self.handle.lock().take() {
            task.abort();
        }
    }
}

async fn respond(State(challenges): State<AcmeChallenges>, Path(token): Path<String>) -> impl IntoResponse {
    match challenges.get(&token) {
        Some(key_auth) => (StatusCode::OK, key_auth).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let challenges = AcmeChallenges::new();
        let response = respond(State(challenges), Path("ghost".to_string())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_token_returns_key_authorization() {
        let challenges = AcmeChallenges::new();
        challenges.add("tok", "tok.thumbprint");
        let response = respond(State(challenges), Path("tok".to_string())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
