//! WebSocket forwarding
//!
//! Replays the client's upgrade handshake against the upstream endpoint
//! (TLS or plaintext per its flag), and once both sides have confirmed the
//! upgrade, hijacks the client connection and copies raw frames in both
//! directions until the pair drains. A half-close on either side propagates
//! to the other.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName as PkiServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::backend::{Endpoint, TlsFlag};
use crate::error::{GatewayError, Result};
use crate::proxy::{
    add_forwarding_headers, empty_body, incoming_body, strip_hop_by_hop, ProxyBody, DIAL_TIMEOUT,
};

/// Whether a request is asking for a WebSocket upgrade.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    let upgrade_is_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_has_upgrade && upgrade_is_websocket
}

/// Build the handshake request replayed to the upstream.
///
/// Hop-by-hop headers are stripped and then the upgrade pair is
/// re-established; `Sec-WebSocket-*` headers and `Host` pass through
/// untouched.
fn build_upstream_request<B>(
    req: &Request<B>,
    client_addr: SocketAddr,
) -> Result<Request<ProxyBody>> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut upstream = Request::builder()
        .method(req.method())
        .uri(path)
        .body(empty_body())
        .map_err(|e| GatewayError::UpstreamProtocol(format!("failed to build request: {}", e)))?;

    *upstream.headers_mut() = req.headers().clone();
    strip_hop_by_hop(upstream.headers_mut());
    add_forwarding_headers(upstream.headers_mut(), client_addr, "https");
    upstream
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    upstream
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));

    Ok(upstream)
}

/// WebSocket forwarder with secure and insecure TLS dialers.
pub struct WebSocketProxy {
    secure_tls: TlsConnector,
    insecure_tls: TlsConnector,
}

impl WebSocketProxy {
    pub fn new(roots: &RootCertStore) -> anyhow::Result<WebSocketProxy> {
        let secure = crate::tls::upstream_client_config(roots, true)?;
        let insecure = crate::tls::upstream_client_config(roots, false)?;
        Ok(WebSocketProxy {
            secure_tls: TlsConnector::from(Arc::new(secure)),
            insecure_tls: TlsConnector::from(Arc::new(insecure)),
        })
    }

    /// Upgrade the client, dial the upstream, and splice the two together.
    pub async fn forward(
        &self,
        mut req: Request<ProxyBody>,
        endpoint: &Endpoint,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        if !is_websocket_upgrade(&req) {
            return Err(GatewayError::ClientProtocol(
                "not a websocket upgrade request".to_string(),
            ));
        }

        debug!(
            upstream = %endpoint.address,
            scheme = endpoint.scheme(true),
            "dialling websocket upstream"
        );

        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&endpoint.address))
            .await
            .map_err(|_| GatewayError::UpstreamDial {
                address: endpoint.address.clone(),
                reason: "dial timeout".to_string(),
            })?
            .map_err(|e| GatewayError::UpstreamDial {
                address: endpoint.address.clone(),
                reason: e.to_string(),
            })?;

        let io: Box<dyn Io> = if endpoint.is_tls() {
            let host = endpoint
                .address
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(&endpoint.address);
            let server_name = PkiServerName::try_from(host.to_string()).map_err(|e| {
                GatewayError::UpstreamDial {
                    address: endpoint.address.clone(),
                    reason: format!("invalid TLS server name: {}", e),
                }
            })?;

            let connector = match endpoint.tls {
                TlsFlag::SkipVerify => &self.insecure_tls,
                _ => &self.secure_tls,
            };
            let tls = connector.connect(server_name, tcp).await.map_err(|e| {
                GatewayError::UpstreamDial {
                    address: endpoint.address.clone(),
                    reason: format!("TLS handshake failed: {}", e),
                }
            })?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| GatewayError::UpstreamProtocol(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("upstream websocket connection closed: {}", e);
            }
        });

        let upstream_req = build_upstream_request(&req, client_addr)?;
        let mut upstream_resp = sender
            .send_request(upstream_req)
            .await
            .map_err(|e| GatewayError::UpstreamProtocol(format!("upgrade request failed: {}", e)))?;

        if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            warn!(
                upstream = %endpoint.address,
                status = %upstream_resp.status(),
                "upstream refused websocket upgrade"
            );
            return Ok(upstream_resp.map(incoming_body));
        }

        // Both sides agreed; park the upgrade futures and splice once they
        // resolve. The client future completes after this 101 is written.
        let client_upgrade = hyper::upgrade::on(&mut req);
        let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .body(empty_body())
            .map_err(|e| GatewayError::UpstreamProtocol(format!("failed to build response: {}", e)))?;
        *response.headers_mut() = upstream_resp.headers().clone();

        let upstream_address = endpoint.address.clone();
        tokio::spawn(async move {
            let client_io = match client_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!("client websocket upgrade failed: {}", e);
                    return;
                }
            };
            let upstream_io = match upstream_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!("upstream websocket upgrade failed: {}", e);
                    return;
                }
            };

            let mut client_io = TokioIo::new(client_io);
            let mut upstream_io = TokioIo::new(upstream_io);

            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((from_client, from_upstream)) => {
                    debug!(
                        upstream = %upstream_address,
                        from_client,
                        from_upstream,
                        "websocket session closed"
                    );
                }
                Err(e) => {
                    debug!(upstream = %upstream_address, "websocket copy ended: {}", e);
                }
            }
        });

        Ok(response)
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}
