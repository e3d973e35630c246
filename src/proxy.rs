//! HTTP forwarding
//!
//! Forwards a client request to a resolved endpoint over one of two
//! pre-built transports: the *secure* transport verifies upstream
//! certificates against the root-CA pool, the *insecure* transport keeps the
//! same pool but skips verification (for endpoints marked TLS but not
//! verifiable). Request and response bodies stream; nothing is buffered.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use tracing::{debug, warn};

use crate::backend::{Endpoint, TlsFlag};
use crate::error::{GatewayError, Result};

/// Streamed body type used throughout the request path.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Upstream dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle keep-alive for pooled upstream connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const MAX_IDLE_PER_HOST: usize = 100;

type UpstreamClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>;

/// Wrap a fixed byte payload as a [`ProxyBody`].
pub fn full_body(payload: impl Into<Bytes>) -> ProxyBody {
    Full::new(payload.into()).map_err(|never| match never {}).boxed()
}

/// An empty [`ProxyBody`].
pub fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Adapt a server-side body into a [`ProxyBody`] without buffering.
pub fn incoming_body(body: Incoming) -> ProxyBody {
    body.boxed()
}

/// Headers a proxy must not forward.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Strip hop-by-hop headers in place. `Host` is preserved.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append the caller's address to `X-Forwarded-For` and record the scheme
/// the client used in `X-Forwarded-Proto`.
pub fn add_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr, proto: &str) {
    let client_ip = client_addr.ip().to_string();

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }

    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
    }
}

/// Build the upstream request URI `{scheme}://{address}{path}?{query}`.
pub fn upstream_uri(endpoint: &Endpoint, req_uri: &Uri, websocket: bool) -> Result<Uri> {
    let path_and_query = req_uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = format!(
        "{}://{}{}",
        endpoint.scheme(websocket),
        endpoint.address,
        path_and_query
    );

    uri.parse::<Uri>().map_err(|e| {
        GatewayError::UpstreamProtocol(format!("invalid upstream URI {:?}: {}", uri, e))
    })
}

/// HTTP forwarder with secure and insecure transports.
pub struct HttpProxy {
    secure_client: UpstreamClient,
    insecure_client: UpstreamClient,
}

impl HttpProxy {
    /// Build both transports over the given root-CA pool.
    pub fn new(roots: &RootCertStore) -> anyhow::Result<HttpProxy> {
        let secure_tls = crate::tls::upstream_client_config(roots, true)?;
        let insecure_tls = crate::tls::upstream_client_config(roots, false)?;

        Ok(HttpProxy {
            secure_client: build_client(secure_tls),
            insecure_client: build_client(insecure_tls),
        })
    }

    fn client_for(&self, endpoint: &Endpoint) -> &UpstreamClient {
        match endpoint.tls {
            TlsFlag::SkipVerify => &self.insecure_client,
            _ => &self.secure_client,
        }
    }

    /// Forward `req` to `endpoint`, streaming both bodies.
    pub async fn forward(
        &self,
        mut req: Request<ProxyBody>,
        endpoint: &Endpoint,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let uri = upstream_uri(endpoint, req.uri(), false)?;
        debug!(upstream = %uri, "forwarding request");

        *req.uri_mut() = uri;
        // The upstream connection negotiates its own protocol version.
        *req.version_mut() = Version::HTTP_11;

        strip_hop_by_hop(req.headers_mut());
        add_forwarding_headers(req.headers_mut(), client_addr, "https");

        let response = self
            .client_for(endpoint)
            .request(req)
            .await
            .map_err(|e| {
                warn!(address = %endpoint.address, "upstream request failed: {}", e);
                if e.is_connect() {
                    GatewayError::UpstreamDial {
                        address: endpoint.address.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    GatewayError::UpstreamProtocol(e.to_string())
                }
            })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, incoming_body(body)))
    }
}

fn build_client(tls: rustls::ClientConfig) -> UpstreamClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(DIAL_TIMEOUT));

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build(https)
}

/// Map a forwarding error onto the client-facing response.
pub fn error_response(error: &GatewayError) -> Response<ProxyBody> {
    let status = match error {
        GatewayError::UpstreamDial { .. } | GatewayError::UpstreamProtocol(_) => {
            StatusCode::BAD_GATEWAY
        }
        GatewayError::NotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::InvalidServerName { .. } | GatewayError::ClientProtocol(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(format!("{}\n", status)))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop_preserves_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("api.example.com"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic xx"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailer", HeaderValue::from_static("Expires"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.get("host").unwrap(), "api.example.com");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_forwarded_for_is_appended() {
        let addr: SocketAddr = "10.0.0.5:4242".parse().unwrap();

        let mut headers = HeaderMap::new();
        add_forwarding_headers(&mut headers, addr, "https");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.5");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.7"),
        );
        add_forwarding_headers(&mut headers, addr, "https");
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "198.51.100.7, 10.0.0.5"
        );
    }

    #[test]
    fn test_upstream_uri_building() {
        use crate::backend::TlsFlag;

        let plain = Endpoint::new("t", "backend:8080", TlsFlag::Plain);
        let secure = Endpoint::new("t", "backend:8443", TlsFlag::Secure);

        let req_uri: Uri = "https://ignored/api/v1?x=1".parse().unwrap();
        assert_eq!(
            upstream_uri(&plain, &req_uri, false).unwrap().to_string(),
            "http://backend:8080/api/v1?x=1"
        );
        assert_eq!(
            upstream_uri(&secure, &req_uri, false).unwrap().to_string(),
            "https://backend:8443/api/v1?x=1"
        );
        assert_eq!(
            upstream_uri(&secure, &req_uri, true).unwrap().to_string(),
            "wss://backend:8443/api/v1?x=1"
        );

        let bare: Uri = "https://ignored".parse().unwrap();
        assert_eq!(
            upstream_uri(&plain, &bare, false).unwrap().to_string(),
            "http://backend:8080/"
        );
    }

    #[test]
    fn test_error_responses() {
        let dial = GatewayError::UpstreamDial {
            address: "backend:80".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(error_response(&dial).status(), StatusCode::BAD_GATEWAY);

        let missing = GatewayError::NotFound("x".to_string());
        assert_eq!(
            error_response(&missing).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let client = GatewayError::ClientProtocol("bad".to_string());
        assert_eq!(error_response(&client).status(), StatusCode::BAD_REQUEST);
    }
}
