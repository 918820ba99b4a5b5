//! HTTP forwarding and the WebSocket hijack tunnel. The plain-HTTP path
//! goes through a pooled hyper client; an upgrade request instead dials the
//! backend directly and becomes a raw byte tunnel once the backend answers
//! 101, since a pooled client connection cannot be handed off as a raw
//! socket afterwards.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::Backend;

#[derive(Clone)]
pub struct ProxyService {
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Incoming>,
}

impl ProxyService {
    pub fn new() -> Self {
        let mut connector = hyper_util::client::legacy::connect::HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build(connector);

        Self { client }
    }

    pub fn is_websocket_upgrade<T>(req: &Request<T>) -> bool {
        let has_token = |name: hyper::header::HeaderName, token: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_lowercase().split(',').any(|t| t.trim() == token))
                .unwrap_or(false)
        };
        has_token(hyper::header::CONNECTION, "upgrade") && has_token(hyper::header::UPGRADE, "websocket")
    }

    /// Forwards a plain HTTP request to `backend`. Preserves the client's
    /// original `Host` header — the teacher's forwarder used to overwrite
    /// it with the backend address, which breaks virtual-host-aware
    /// backends that trust `Host` to pick their own routing.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        backend: &Backend,
    ) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let backend_uri = format!(
            "http://{}{}",
            backend.addr(),
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        debug!(backend_uri = %backend_uri, "forwarding request");

        let original_host = req.headers().get(hyper::header::HOST).cloned();
        *req.uri_mut() = backend_uri.parse()?;

        let headers = req.headers_mut();
        headers.insert("X-Forwarded-Proto", hyper::header::HeaderValue::from_static("https"));
        if let Some(host) = &original_host {
            headers.insert("X-Forwarded-Host", host.clone());
            headers.insert(hyper::header::HOST, host.clone());
        }

        let method = req.method().clone();
        let response = self.client.request(req).await?;
        let (parts, body) = response.into_parts();
        tracing::info!(target: "wharfd::access_log", %method, backend = %backend.addr(), status = %parts.status.as_u16(), "request forwarded");
        Ok(Response::from_parts(parts, body.map_err(|e| e).boxed()))
    }

    /// Dials the backend directly, replays the upgrade request over that
    /// connection, and — once the backend answers 101 — hands both sides
    /// off to a raw bidirectional byte copy. Returns the backend's
    /// (possibly non-101) response either way so the caller can relay it
    /// to the client unchanged.
    pub async fn tunnel_websocket(
        &self,
        mut req: Request<Incoming>,
        backend: &Backend,
    ) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();
        let original_host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .unwrap_or_else(|| backend.addr());

        let mut backend_stream = TcpStream::connect(backend.addr()).await?;

        let mut request_lines = format!("GET {path} HTTP/1.1\r\nHost: {original_host}\r\n");
        for (name, value) in req.headers() {
            if name == hyper::header::HOST {
                continue;
            }
            if let Ok(v) = value.to_str() {
                request_lines.push_str(name.as_str());
                request_lines.push_str(": ");
                request_lines.push_str(v);
                request_lines.push_str("\r\n");
            }
        }
        request_lines.push_str("X-Forwarded-Proto: https\r\n\r\n");

        backend_stream.write_all(request_lines.as_bytes()).await?;

        let (status_line, response_headers, leftover) = read_http_response_head(&mut backend_stream).await?;
        let is_switching = status_line.contains(" 101 ");

        let mut response_builder = Response::builder().status(if is_switching { 101 } else { 502 });
        for (name, value) in &response_headers {
            response_builder = response_builder.header(name, value);
        }

        if !is_switching {
            warn!(backend = %backend.addr(), status = %status_line.trim(), "backend declined websocket upgrade");
            let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed();
            return Ok(response_builder.body(body)?);
        }

        let on_upgrade = hyper::upgrade::on(&mut req);
        let backend_addr = backend.addr();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let mut client_io = hyper_util::rt::TokioIo::new(upgraded);
                    if !leftover.is_empty() {
                        if let Err(e) = client_io.write_all(&leftover).await {
                            error!(error = %e, "failed relaying buffered websocket bytes to client");
                            return;
                        }
                    }
                    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_stream).await {
                        Ok((to_backend, to_client)) => {
                            info!(backend = %backend_addr, to_backend, to_client, "websocket tunnel closed");
                        }
                        Err(e) => warn!(backend = %backend_addr, error = %e, "websocket tunnel error"),
                    }
                }
                Err(e) => error!(error = %e, "client connection upgrade failed"),
            }
        });

        let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed();
        Ok(response_builder.body(body)?)
    }
}

impl Default for ProxyService {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a raw HTTP/1.1 response's status line and headers off `stream`,
/// returning them plus any bytes already read past the header terminator
/// (may contain the first frame of the now-upgraded protocol).
async fn read_http_response_head(stream: &mut TcpStream) -> anyhow::Result<(String, Vec<(String, String)>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    let terminator = b"\r\n\r\n";

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("backend closed connection before completing response headers");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, terminator) {
            let leftover = buf.split_off(pos + terminator.len());
            let head = String::from_utf8_lossy(&buf).to_string();
            let mut lines = head.split("\r\n");
            let status_line = lines.next().unwrap_or_default().to_string();
            let headers = lines
                .filter(|l| !l.is_empty())
                .filter_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    Some((name.trim().to_string(), value.trim().to_string()))
                })
                .collect();
            return Ok((status_line, headers, leftover));
        }
        if buf.len() > 64 * 1024 {
            anyhow::bail!("backend response headers exceeded size limit");
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_subslice_locates_terminator() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\nleftover";
        let pos = find_subslice(data, b"\r\n\r\n").unwrap();
        assert_eq!(&data[pos + 4..], b"leftover");
    }

    #[test]
    fn find_subslice_absent_returns_none() {
        assert!(find_subslice(b"no terminator here", b"\r\n\r\n").is_none());
    }
}
