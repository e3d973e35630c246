//! Listeners and the frontend dispatcher
//!
//! The secure listener accepts TCP connections, optionally unwraps the
//! PROXY protocol v1 header, completes the TLS handshake with a certificate
//! chosen per SNI, and hands the decrypted requests to the dispatcher. The
//! dispatcher answers the health check itself, resolves every other request
//! through the locator chain, and forwards to the HTTP or WebSocket proxy.
//!
//! The insecure listener serves only two things: ACME HTTP-01 challenge
//! responses and a 307 redirect to the secure port.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Host, Path, State};
use axum::http::Uri as AxumUri;
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use axum::Router;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

use crate::acme::AcmeManager;
use crate::backend::Locator;
use crate::error::GatewayError;
use crate::health::{HealthChecker, HEALTH_PATH};
use crate::name::ServerName;
use crate::proxy::{error_response, full_body, incoming_body, HttpProxy, ProxyBody};
use crate::proxy_protocol::ProxyProtocolStream;
use crate::tls::TlsState;
use crate::websocket::{is_websocket_upgrade, WebSocketProxy};

/// TLS handshake deadline. The certificate lookup itself (which may include
/// an ACME issuance) is not bounded by this.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Body served with locator misses.
const UNAVAILABLE_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>503 Service Unavailable</title></head>\n<body>\n<h1>Service Unavailable</h1>\n<p>There is no back-end service available to handle this request.</p>\n</body>\n</html>\n";

/// Everything the dispatcher needs to answer a request.
pub struct GatewayState {
    pub locator: Arc<dyn Locator>,
    pub http_proxy: HttpProxy,
    pub websocket_proxy: WebSocketProxy,
    pub health: HealthChecker,
}

/// Dispatch one TLS-terminated request.
pub async fn dispatch(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.uri().path() == HEALTH_PATH {
        return Ok(state.health.respond().await);
    }

    // Host comes from the :authority pseudo-header on HTTP/2 and the Host
    // header on HTTP/1.1.
    let host = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

    let Some(host) = host else {
        debug!("request without a host, rejecting");
        return Ok(error_response(&GatewayError::ClientProtocol(
            "missing host".to_string(),
        )));
    };

    let name = match ServerName::from_host(&host) {
        Ok(name) => name,
        Err(e) => {
            debug!("unparseable request host {:?}: {}", host, e);
            return Ok(error_response(&e));
        }
    };

    let Some(endpoint) = state.locator.locate(&name).await else {
        debug!(name = %name, "no endpoint for request host");
        return Ok(unavailable_response());
    };

    let req = req.map(incoming_body);
    let result = if is_websocket_upgrade(&req) {
        state
            .websocket_proxy
            .forward(req, &endpoint, client_addr)
            .await
    } else {
        state.http_proxy.forward(req, &endpoint, client_addr).await
    };

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(name = %name, endpoint = %endpoint, "forwarding failed: {}", e);
            Ok(error_response(&e))
        }
    }
}

fn unavailable_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("content-type", "text/html; charset=utf-8")
        .body(full_body(UNAVAILABLE_PAGE))
        .unwrap_or_else(|_| Response::new(full_body(UNAVAILABLE_PAGE)))
}

/// Run the secure listener until the shutdown signal flips.
///
/// The socket is bound by the caller so that bind failures surface as
/// startup errors.
pub async fn run_secure_listener(
    listener: TcpListener,
    tls_state: Arc<TlsState>,
    state: Arc<GatewayState>,
    proxy_protocol: bool,
    active_connections: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(
        "listening for HTTPS on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    if proxy_protocol {
        info!("PROXY protocol v1 unwrapping enabled");
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("secure listener stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };

                let tls_state = tls_state.clone();
                let state = state.clone();
                let active = active_connections.clone();

                tokio::spawn(async move {
                    active.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) =
                        handle_connection(stream, peer_addr, tls_state, state, proxy_protocol)
                            .await
                    {
                        debug!(peer = %peer_addr, "connection ended with error: {}", e);
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    tls_state: Arc<TlsState>,
    state: Arc<GatewayState>,
    proxy_protocol: bool,
) -> anyhow::Result<()> {
    let stream = if proxy_protocol {
        crate::proxy_protocol::accept(stream, peer_addr)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?
    } else {
        ProxyProtocolStream::passthrough(stream, peer_addr)
    };
    let remote_addr = stream.remote_addr();

    serve_tls(stream, remote_addr, tls_state, state).await
}

async fn serve_tls<S>(
    stream: S,
    remote_addr: SocketAddr,
    tls_state: Arc<TlsState>,
    state: Arc<GatewayState>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Park the ClientHello, pick a certificate for its SNI, then finish the
    // handshake. The certificate lookup may await an ACME issuance, so only
    // the wire phases run under the handshake timeout.
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);

    let start = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor)
        .await
        .map_err(|_| anyhow::anyhow!("TLS ClientHello timeout from {}", remote_addr))?
        .map_err(|e| anyhow::anyhow!("TLS accept error from {}: {}", remote_addr, e))?;

    let sni = start.client_hello().server_name().map(str::to_string);
    let config = tls_state.config_for_sni(sni.as_deref()).await;

    let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, start.into_stream(config))
        .await
        .map_err(|_| anyhow::anyhow!("TLS handshake timeout from {}", remote_addr))?
        .map_err(|e| anyhow::anyhow!("TLS handshake failed from {}: {}", remote_addr, e))?;

    let service = service_fn(move |req| dispatch(req, state.clone(), remote_addr));

    auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error from {}: {}", remote_addr, e))
}

#[derive(Clone)]
struct RedirectState {
    https_port: u16,
    acme: Option<Arc<AcmeManager>>,
}

/// Compose the redirect target for the insecure listener.
fn redirect_target(host: &str, https_port: u16, uri: &AxumUri) -> String {
    let host = host.split(':').next().unwrap_or(host);
    let path = uri.path();
    let query = uri
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();

    if https_port == 443 {
        format!("https://{}{}{}", host, path, query)
    } else {
        format!("https://{}:{}{}{}", host, https_port, path, query)
    }
}

async fn redirect_handler(
    State(state): State<RedirectState>,
    Host(host): Host,
    uri: AxumUri,
) -> Redirect {
    Redirect::temporary(&redirect_target(&host, state.https_port, &uri))
}

async fn acme_challenge_handler(
    State(state): State<RedirectState>,
    Path(token): Path<String>,
) -> axum::response::Response {
    let response = state
        .acme
        .as_ref()
        .and_then(|manager| manager.challenge_response(&token));

    match response {
        Some(key_authorization) => (StatusCode::OK, key_authorization).into_response(),
        None => (StatusCode::NOT_FOUND, "no such challenge\n").into_response(),
    }
}

/// Run the insecure listener: ACME challenges plus the HTTPS redirect.
pub async fn run_redirect_server(
    listener: TcpListener,
    https_port: u16,
    acme: Option<Arc<AcmeManager>>,
    proxy_protocol: bool,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/.well-known/acme-challenge/:token", get(acme_challenge_handler))
        .fallback(redirect_handler)
        .with_state(RedirectState { https_port, acme });

    info!(
        "listening for HTTP redirects on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("redirect listener stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed on insecure port: {}", e);
                        continue;
                    }
                };

                let router = router.clone();
                tokio::spawn(async move {
                    let stream = if proxy_protocol {
                        match crate::proxy_protocol::accept(stream, peer_addr).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                debug!(peer = %peer_addr, "dropping connection: {}", e);
                                return;
                            }
                        }
                    } else {
                        ProxyProtocolStream::passthrough(stream, peer_addr)
                    };

                    let service = TowerToHyperService::new(router);
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(peer = %peer_addr, "redirect connection error: {}", e);
                    }
                });
            }
        }
    }
}

/// Wait for in-flight connections to drain, up to the grace period.
pub async fn drain_connections(active: &Arc<AtomicUsize>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let count = active.load(Ordering::SeqCst);
        if count == 0 {
            info!("all connections drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            error!("grace period elapsed with {} connection(s) still open", count);
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
