//! Wires address resolution, transport selection, and response rewriting
//! into a single axum handler mountable at `/proxy/*rest`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{OriginalUri, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use guildnet_runtime::MeshDialer;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::address::{self, ProxyTarget};
use crate::director;
use crate::rewrite;
use crate::transport::MeshConnector;

const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Resolves a logical workspace id (form 3: `/proxy/server/<id>/<rest>`) to
/// its concrete scheme/host:port/path. Implemented outside this crate
/// because resolution depends on the Registry and RBAC layers.
#[async_trait::async_trait]
pub trait ResolveServer: Send + Sync {
    async fn resolve(&self, id: &str, sub_path: &str) -> Option<(String, String, String)>;
}

/// Forwards a request through the Kubernetes API-server-proxy transport
/// (the `/api/`, `/apis/` shapes) instead of dialing the workspace directly.
/// Implemented outside this crate: building one needs the per-cluster
/// `kube::Client` the binary's Registry owns.
#[async_trait::async_trait]
pub trait ApiServerProxyTransport: Send + Sync {
    async fn request(&self, request: http::Request<Body>) -> Result<http::Response<Body>, String>;
}

pub struct ProxyState {
    pub mesh: Option<Arc<dyn MeshDialer>>,
    pub resolver: Arc<dyn ResolveServer>,
    /// `None` until a caller wires up a cluster's `kube::Client` as an
    /// `ApiServerProxyTransport`; `/api/`, `/apis/` requests then fall back
    /// to the mesh or direct transport like any other path.
    pub api_proxy: Option<Arc<dyn ApiServerProxyTransport>>,
}

async fn resolve_target(state: &ProxyState, path: &str, query: &HashMap<String, String>) -> Result<(ProxyTarget, String), Response> {
    let base_prefix = address::base_prefix_from_path(path);

    if let Some(rest) = path.strip_prefix("/proxy/server/") {
        let (id, sub_path) = rest.split_once('/').unwrap_or((rest, ""));
        let (scheme, hostport, resolved_path) = state
            .resolver
            .resolve(id, sub_path)
            .await
            .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "unknown server id"))?;
        let target = address::from_resolved(scheme, hostport, resolved_path)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))?;
        return Ok((target, base_prefix));
    }

    if let Some(rest) = path.strip_prefix("/proxy/") {
        let target = address::from_path(rest).map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))?;
        return Ok((target, base_prefix));
    }

    let target = address::from_query(query).map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))?;
    Ok((target, base_prefix))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn rewrite_response_headers(headers: &mut HeaderMap, base_prefix: &str) {
    for name in rewrite::HEADERS_TO_STRIP {
        headers.remove(*name);
    }
    for (name, value) in rewrite::FIXED_HEADERS {
        headers.insert(*name, HeaderValue::from_static(value));
    }

    let csp = headers
        .get("content-security-policy")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let rewritten_csp = rewrite::rewrite_csp(csp.as_deref());
    if let Ok(value) = HeaderValue::from_str(&rewritten_csp) {
        headers.insert("content-security-policy", value);
    }

    if let Ok(value) = HeaderValue::from_str(&rewrite::service_worker_allowed(base_prefix)) {
        headers.insert("service-worker-allowed", value);
    }

    if let Some(location) = headers.get("location").and_then(|v| v.to_str().ok()).map(str::to_string) {
        let rewritten = rewrite::rewrite_location(&location, base_prefix);
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            headers.insert("location", value);
        }
    }

    let cookies: Vec<String> = headers
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    if !cookies.is_empty() {
        headers.remove("set-cookie");
        for cookie in cookies {
            let rewritten = rewrite::rewrite_set_cookie(&cookie, base_prefix);
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                headers.append("set-cookie", value);
            }
        }
    }

    if !headers.contains_key("referrer-policy") {
        headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    }
}

/// `true` when the client asked to switch protocols (WebSocket passthrough),
/// i.e. `Connection: Upgrade` plus an `Upgrade` header naming the protocol.
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let asks_to_upgrade = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    asks_to_upgrade && headers.contains_key(axum::http::header::UPGRADE)
}

/// Handles every method on `/proxy/*rest` and the legacy `/proxy?to=...` form.
pub async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    let path = uri.path().to_string();
    let (target, base_prefix) = match resolve_target(&state, &path, &query).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let is_api_path = director::is_api_server_proxy_path(path.strip_prefix(&base_prefix).unwrap_or(&path));
    let use_mesh = crate::transport::use_mesh_transport(is_api_path, state.api_proxy.is_some());
    let uri_string = director::rewrite_direct_uri(&target, &path, &base_prefix, uri.query().unwrap_or(""));

    let wants_upgrade = is_upgrade_request(req.headers());
    let mut req = req;
    let client_upgrade: Option<OnUpgrade> = wants_upgrade.then(|| hyper::upgrade::on(&mut req));

    let (parts, body) = req.into_parts();
    let mut request = match http::Request::builder()
        .method(parts.method)
        .uri(&uri_string)
        .body(body)
    {
        Ok(req) => req,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    *request.headers_mut() = parts.headers;

    let response: Result<http::Response<Body>, String> = if use_mesh {
        match &state.mesh {
            Some(dialer) => {
                let client = LegacyClient::builder(TokioExecutor::new()).build(MeshConnector::new(dialer.clone()));
                client.request(request).await.map(|r| r.map(Body::new)).map_err(|e| e.to_string())
            }
            None => {
                warn!(msg = "no mesh dialer configured, falling back to direct connection");
                let client = LegacyClient::builder(TokioExecutor::new()).build(crate::transport::build_https_connector());
                client.request(request).await.map(|r| r.map(Body::new)).map_err(|e| e.to_string())
            }
        }
    } else {
        match &state.api_proxy {
            Some(transport) => transport.request(request).await,
            None => {
                let client = LegacyClient::builder(TokioExecutor::new()).build(crate::transport::build_https_connector());
                client.request(request).await.map(|r| r.map(Body::new)).map_err(|e| e.to_string())
            }
        }
    };

    match response {
        Ok(mut resp) => {
            if wants_upgrade && resp.status() == StatusCode::SWITCHING_PROTOCOLS {
                if let Some(client_upgrade) = client_upgrade {
                    let upstream_upgrade = hyper::upgrade::on(&mut resp);
                    tokio::spawn(relay_upgrade(client_upgrade, upstream_upgrade));
                }
            }
            rewrite_response_headers(resp.headers_mut(), &base_prefix);
            resp.into_response()
        }
        Err(e) => {
            warn!(msg = "proxy upstream request failed", %e);
            error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

/// Bidirectionally relays bytes between a client's and an upstream's
/// hijacked connections once both have completed the HTTP Upgrade handshake
/// (WebSocket passthrough).
async fn relay_upgrade(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(msg = "upgrade handshake failed", %e);
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut upstream_io = TokioIo::new(upstream);

    if let Err(e) = pump(&mut client_io, &mut upstream_io, flush_interval()).await {
        warn!(msg = "upgraded connection relay ended with an error", %e);
    }
}

/// Copies bytes in both directions until either side closes, forcing a
/// flush every `flush_every` so a buffered write doesn't stall a WebSocket
/// peer waiting on a frame that already arrived.
async fn pump<A, B>(a: &mut A, b: &mut B, flush_every: std::time::Duration) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a_buf = [0u8; 8192];
    let mut b_buf = [0u8; 8192];
    let mut ticker = tokio::time::interval(flush_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = a.read(&mut a_buf) => {
                let n = result?;
                if n == 0 {
                    b.shutdown().await?;
                    return Ok(());
                }
                b.write_all(&a_buf[..n]).await?;
            }
            result = b.read(&mut b_buf) => {
                let n = result?;
                if n == 0 {
                    a.shutdown().await?;
                    return Ok(());
                }
                a.write_all(&b_buf[..n]).await?;
            }
            _ = ticker.tick() => {
                a.flush().await?;
                b.flush().await?;
            }
        }
    }
}

pub fn flush_interval() -> std::time::Duration {
    FLUSH_INTERVAL
}
