//! HTTP forwarding for the redirect table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse as _, Response};
use axum::Router;
use reqwest::{Client, Url};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{Redirect, RedirectTable};
use crate::error::{AppError, Result};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

pub struct ProxyRouter {
    table: Arc<RedirectTable>,
    client: Client,
}

impl ProxyRouter {
    pub fn new(table: Arc<RedirectTable>) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;
        Ok(Self { table, client })
    }

    pub fn table(&self) -> &Arc<RedirectTable> {
        &self.table
    }

    /// Forward `req` to the upstream registered for its host.
    ///
    /// Unknown hosts get a 404 without any upstream traffic; upstream failures
    /// get a 502.
    pub async fn handle_proxy(&self, req: Request, client_addr: Option<SocketAddr>) -> Response {
        let Some(host) = request_host(&req) else {
            log::warn!("Proxy request without host: {}", req.uri());
            return (StatusCode::NOT_FOUND, "no host").into_response();
        };
        let Some(redirect) = self.table.get_redirect_by_host(&host) else {
            log::warn!("No redirect registered for host {}", host);
            return (StatusCode::NOT_FOUND, "unknown host").into_response();
        };

        let url = match upstream_url(&redirect, req.uri()) {
            Ok(url) => url,
            Err(e) => {
                log::error!("Bad upstream for {}: {}", host, e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        append_forwarded(&mut headers, &host, client_addr);

        log::debug!("Proxy {} {}{} -> {}", parts.method, host, parts.uri, url);

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        match upstream {
            Ok(resp) => {
                let status = resp.status();
                let mut headers = resp.headers().clone();
                strip_hop_by_hop(&mut headers);

                let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                if e.is_body() {
                    log::debug!("Client body stream for {} ended: {}", host, e);
                } else {
                    log::error!("Upstream {} for {} failed: {}", redirect.target, host, e);
                }
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
}

/// Target base path joined with the request path by a single slash; the
/// request query replaces any query on the target.
fn upstream_url(redirect: &Redirect, uri: &Uri) -> Result<Url> {
    let mut url = Url::parse(&redirect.target)
        .map_err(|e| AppError::config(format!("Invalid target {}: {}", redirect.target, e)))?;
    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        uri.path().trim_start_matches('/')
    );
    url.set_path(&path);
    url.set_query(uri.query());
    Ok(url)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded(headers: &mut HeaderMap, host: &str, client_addr: Option<SocketAddr>) {
    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
}

async fn proxy_handler(
    State(router): State<Arc<ProxyRouter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    router.handle_proxy(req, Some(addr)).await
}

/// The proxy bound to a socket. Every path of every host goes to [`ProxyRouter`].
pub struct ProxyServer {
    listener: TcpListener,
    router: Arc<ProxyRouter>,
}

impl ProxyServer {
    pub async fn bind(addr: &str, router: Arc<ProxyRouter>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::network(format!("Failed to bind proxy on {}: {}", addr, e)))?;
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `token` is cancelled; in-flight requests are drained.
    pub async fn serve(self, token: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let app = Router::new()
            .fallback(proxy_handler)
            .with_state(self.router);

        log::info!("Proxy listening on {}", addr);
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| AppError::network(format!("Proxy server failed: {}", e)))?;

        log::info!("Proxy on {} stopped", addr);
        Ok(())
    }
}
