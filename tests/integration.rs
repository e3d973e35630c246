//! Integration tests for the honeycomb gateway
//!
//! These tests drive the dispatcher over real TCP connections (TLS-free, so
//! the request pipeline is exercised without certificate fixtures):
//! - locator precedence between static routes
//! - 503 error page for unresolvable hosts
//! - HTTP forwarding with forwarded-for rewrites
//! - WebSocket upgrade hijacking and bidirectional byte copy
//! - PROXY protocol v1 unwrapping in front of the dispatcher
//! - the insecure listener's 307 redirect

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use honeycomb::backend::{AggregateLocator, Endpoint, Locator, StaticLocator, TlsFlag};
use honeycomb::cache::CacheLocator;
use honeycomb::catalog::CatalogLocator;
use honeycomb::health::HealthChecker;
use honeycomb::http_listener::{dispatch, run_redirect_server, GatewayState};
use honeycomb::matcher::Matcher;
use honeycomb::name::ServerName;
use honeycomb::proxy::HttpProxy;
use honeycomb::proxy_protocol::ProxyProtocolStream;
use honeycomb::websocket::WebSocketProxy;

/// Build a gateway state with the given static routes.
fn gateway_state(routes: Vec<(Matcher, Endpoint)>) -> Arc<GatewayState> {
    let roots = rustls::RootCertStore::empty();
    let docker = bollard::Docker::connect_with_local_defaults().unwrap();
    Arc::new(GatewayState {
        locator: Arc::new(StaticLocator::new(routes)),
        http_proxy: HttpProxy::new(&roots).unwrap(),
        websocket_proxy: WebSocketProxy::new(&roots).unwrap(),
        health: HealthChecker::new(docker, Arc::new(CatalogLocator::new())),
    })
}

/// Serve the dispatcher over plain TCP. Returns the bound address.
async fn spawn_gateway(state: Arc<GatewayState>, proxy_protocol: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer_addr)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let stream = if proxy_protocol {
                    match honeycomb::proxy_protocol::accept(stream, peer_addr).await {
                        Ok(stream) => stream,
                        Err(_) => return,
                    }
                } else {
                    ProxyProtocolStream::passthrough(stream, peer_addr)
                };
                let remote_addr = stream.remote_addr();

                let service =
                    service_fn(move |req| dispatch(req, state.clone(), remote_addr));
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Plain HTTP backend that echoes interesting request facts into headers.
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let forwarded_for = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    let proto = req
                        .headers()
                        .get("x-forwarded-proto")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();

                    Response::builder()
                        .header("x-echo-forwarded-for", forwarded_for)
                        .header("x-echo-host", host)
                        .header("x-echo-proto", proto)
                        .body(Full::new(Bytes::from_static(b"backend-ok")))
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Raw TCP backend that accepts a WebSocket upgrade and then echoes bytes.
async fn spawn_websocket_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                // Consume the handshake request head
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }

                let response = b"HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
                if stream.write_all(response).await.is_err() {
                    return;
                }

                // Echo everything after the upgrade
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

fn route(pattern: &str, address: &str) -> (Matcher, Endpoint) {
    (
        Matcher::compile(pattern).unwrap(),
        Endpoint::new(format!("test route {}", pattern), address, TlsFlag::Plain),
    )
}

/// Send one HTTP/1.1 request and read the whole response.
async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn test_literal_pattern_beats_wildcard_across_the_chain() {
    let literal = Endpoint::new("literal", "literal:8080", TlsFlag::Plain);
    let wildcard = Endpoint::new("wildcard", "wildcard:8080", TlsFlag::Plain);

    let static_locator = StaticLocator::new(vec![
        (Matcher::compile("*.example.com").unwrap(), wildcard),
        (Matcher::compile("api.example.com").unwrap(), literal.clone()),
    ]);

    let aggregate = AggregateLocator::new(vec![
        Arc::new(static_locator),
        Arc::new(CatalogLocator::new()),
    ]);
    let cache = CacheLocator::new(Arc::new(aggregate));

    let resolved = cache
        .locate(&ServerName::parse("api.example.com"))
        .await
        .unwrap();
    assert_eq!(resolved, literal);

    // Second lookup comes from the cache and stays identical
    let cached = cache
        .locate(&ServerName::parse("api.example.com"))
        .await
        .unwrap();
    assert_eq!(cached, resolved);
}

#[tokio::test]
async fn test_unknown_host_gets_503_error_page() {
    let state = gateway_state(Vec::new());
    let addr = spawn_gateway(state, false).await;

    let response = raw_request(
        addr,
        "GET /anything HTTP/1.1\r\nHost: unknown.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
    assert!(response.contains("Service Unavailable"));
}

#[tokio::test]
async fn test_request_without_host_is_rejected() {
    let state = gateway_state(Vec::new());
    let addr = spawn_gateway(state, false).await;

    let response = raw_request(addr, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
}

#[tokio::test]
async fn test_health_endpoint_reports_json() {
    let state = gateway_state(Vec::new());
    let addr = spawn_gateway(state, false).await;

    let response = raw_request(
        addr,
        "GET /honeycomb/health HTTP/1.1\r\nHost: anything.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    // Catalog reachability depends on the host environment; the contract is
    // the JSON shape and the ok/degraded vocabulary.
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    let json: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
    assert!(json["status"] == "ok" || json["status"] == "degraded");
    assert!(json["details"]["routes"].is_number());
}

#[tokio::test]
async fn test_http_forwarding_rewrites_and_streams() {
    let backend = spawn_echo_backend().await;
    let state = gateway_state(vec![route("svc.example.com", &backend.to_string())]);
    let addr = spawn_gateway(state, false).await;

    let response = raw_request(
        addr,
        "GET /api?x=1 HTTP/1.1\r\nHost: svc.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("backend-ok"));

    let lower = response.to_lowercase();
    assert!(
        lower.contains("x-echo-forwarded-for: 127.0.0.1"),
        "X-Forwarded-For missing: {}",
        response
    );
    assert!(lower.contains("x-echo-host: svc.example.com"));
    assert!(lower.contains("x-echo-proto: https"));
}

#[tokio::test]
async fn test_upstream_dial_failure_maps_to_502() {
    // An address nothing listens on
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let state = gateway_state(vec![route("svc.example.com", &dead_addr.to_string())]);
    let addr = spawn_gateway(state, false).await;

    let response = raw_request(
        addr,
        "GET / HTTP/1.1\r\nHost: svc.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
}

#[tokio::test]
async fn test_websocket_upgrade_and_byte_relay() {
    let backend = spawn_websocket_echo_backend().await;
    let state = gateway_state(vec![route("echo.example.com", &backend.to_string())]);
    let addr = spawn_gateway(state, false).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\n\
              Host: echo.example.com\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    // Read the 101 response head
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).to_string();
    assert!(head.starts_with("HTTP/1.1 101"), "got: {}", head);
    assert!(head
        .to_lowercase()
        .contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo="));

    // After the upgrade the gateway must relay raw bytes both ways
    stream.write_all(b"frame-one").await.unwrap();
    let mut echoed = [0u8; 9];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"frame-one");

    stream.write_all(b"frame-two").await.unwrap();
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"frame-two");
}

#[tokio::test]
async fn test_proxy_protocol_source_flows_into_forwarded_for() {
    let backend = spawn_echo_backend().await;
    let state = gateway_state(vec![route("svc.example.com", &backend.to_string())]);
    let addr = spawn_gateway(state, true).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"PROXY TCP4 10.0.0.5 10.0.0.6 4242 443\r\n\
              GET / HTTP/1.1\r\nHost: svc.example.com\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response).to_lowercase();

    assert!(response.contains("x-echo-forwarded-for: 10.0.0.5"), "got: {}", response);
}

#[tokio::test]
async fn test_redirect_server_issues_307() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(run_redirect_server(listener, 8443, None, false, shutdown_rx));

    let response = raw_request(
        addr,
        "GET /login?next=%2Fhome HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    let lower = response.to_lowercase();
    assert!(lower.starts_with("http/1.1 307"), "got: {}", response);
    assert!(
        lower.contains("location: https://example.com:8443/login?next=%2fhome"),
        "got: {}",
        response
    );
}

#[tokio::test]
async fn test_redirect_server_404s_unknown_acme_challenge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(run_redirect_server(listener, 8443, None, false, shutdown_rx));

    let response = raw_request(
        addr,
        "GET /.well-known/acme-challenge/bogus-token HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_inner_call() {
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Locator for Counting {
        async fn locate(&self, _name: &ServerName) -> Option<Endpoint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Some(Endpoint::new("counted", "one:1", TlsFlag::Plain))
        }
    }

    let inner = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let cache = Arc::new(CacheLocator::new(inner.clone()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            cache.locate(&ServerName::parse("shared.example.com")).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }

    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
}
