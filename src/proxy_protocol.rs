//! PROXY protocol v1 support
//!
//! When the gateway sits behind a load balancer that speaks the (ASCII)
//! PROXY protocol, every accepted connection starts with a line like
//!
//! ```text
//! PROXY TCP4 10.0.0.5 10.0.0.6 4242 443\r\n
//! ```
//!
//! [`accept`] consumes that line and returns a stream whose reported remote
//! address is the parsed source. Connections that do not start with the
//! `PROXY ` literal get their consumed bytes replayed, so the TLS handshake
//! sees an unchanged byte stream. A header longer than 107 octets or a
//! malformed line closes the connection. Binary v2 is not supported.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{GatewayError, Result};

/// Longest possible v1 header line including CRLF.
pub const MAX_HEADER_LENGTH: usize = 107;

/// Deadline for the header to arrive in full.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

const SIGNATURE: &[u8] = b"PROXY ";

/// Parsed v1 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address, absent for `UNKNOWN`
    pub source: Option<SocketAddr>,
    /// Address the client connected to, absent for `UNKNOWN`
    pub destination: Option<SocketAddr>,
}

/// Parse one header line (without the trailing CRLF).
pub fn parse_header(line: &str) -> Result<ProxyHeader> {
    let malformed = |reason: &str| GatewayError::ClientProtocol(format!(
        "malformed PROXY header {:?}: {}",
        line, reason
    ));

    let mut fields = line.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(malformed("missing PROXY literal"));
    }

    let protocol = fields.next().ok_or_else(|| malformed("missing protocol"))?;
    match protocol {
        // An UNKNOWN header may carry trailing junk; the connection is
        // accepted with the TCP-level peer address.
        "UNKNOWN" => Ok(ProxyHeader {
            source: None,
            destination: None,
        }),
        "TCP4" | "TCP6" => {
            let src_ip: IpAddr = fields
                .next()
                .ok_or_else(|| malformed("missing source address"))?
                .parse()
                .map_err(|_| malformed("bad source address"))?;
            let dst_ip: IpAddr = fields
                .next()
                .ok_or_else(|| malformed("missing destination address"))?
                .parse()
                .map_err(|_| malformed("bad destination address"))?;
            let src_port: u16 = fields
                .next()
                .ok_or_else(|| malformed("missing source port"))?
                .parse()
                .map_err(|_| malformed("bad source port"))?;
            let dst_port: u16 = fields
                .next()
                .ok_or_else(|| malformed("missing destination port"))?
                .parse()
                .map_err(|_| malformed("bad destination port"))?;

            if fields.next().is_some() {
                return Err(malformed("trailing fields"));
            }

            let want_v4 = protocol == "TCP4";
            if src_ip.is_ipv4() != want_v4 || dst_ip.is_ipv4() != want_v4 {
                return Err(malformed("address family does not match protocol"));
            }

            Ok(ProxyHeader {
                source: Some(SocketAddr::new(src_ip, src_port)),
                destination: Some(SocketAddr::new(dst_ip, dst_port)),
            })
        }
        other => Err(malformed(&format!("unknown protocol {:?}", other))),
    }
}

pin_project! {
    /// Stream wrapper that replays bytes consumed while sniffing the header.
    pub struct ProxyProtocolStream<S> {
        #[pin]
        inner: S,
        prefix: Vec<u8>,
        offset: usize,
        remote_addr: SocketAddr,
    }
}

impl<S> ProxyProtocolStream<S> {
    /// Wrap a stream without sniffing, for listeners where the PROXY
    /// protocol is disabled. No bytes are buffered or consumed.
    pub fn passthrough(inner: S, peer_addr: SocketAddr) -> Self {
        Self {
            inner,
            prefix: Vec::new(),
            offset: 0,
            remote_addr: peer_addr,
        }
    }

    /// The effective remote address: the header's source if one was parsed,
    /// otherwise the TCP-level peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl<S: AsyncRead> AsyncRead for ProxyProtocolStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();

        if *this.offset < this.prefix.len() {
            let remaining = &this.prefix[*this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            *this.offset += n;
            if *this.offset == this.prefix.len() {
                this.prefix.clear();
                *this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for ProxyProtocolStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Sniff an accepted connection for a PROXY v1 header.
///
/// Returns the wrapped stream; its [`ProxyProtocolStream::remote_addr`]
/// reflects the header's source address when one was present. Errors mean
/// the connection must be closed.
pub async fn accept<S>(stream: S, peer_addr: SocketAddr) -> Result<ProxyProtocolStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HEADER_TIMEOUT, sniff(stream, peer_addr))
        .await
        .map_err(|_| {
            GatewayError::ClientProtocol("timed out waiting for PROXY header".to_string())
        })?
}

async fn sniff<S>(mut stream: S, peer_addr: SocketAddr) -> Result<ProxyProtocolStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut consumed: Vec<u8> = Vec::with_capacity(MAX_HEADER_LENGTH);
    let mut chunk = [0u8; MAX_HEADER_LENGTH];

    loop {
        // Decide as soon as the signature can be ruled out, so non-PROXY
        // connections are not held hostage waiting for a CRLF.
        let head = consumed.len().min(SIGNATURE.len());
        if consumed[..head] != SIGNATURE[..head] {
            return Ok(ProxyProtocolStream {
                inner: stream,
                prefix: consumed,
                offset: 0,
                remote_addr: peer_addr,
            });
        }

        if consumed.len() >= SIGNATURE.len() {
            if let Some(line_end) = find_crlf(&consumed) {
                let line = std::str::from_utf8(&consumed[..line_end]).map_err(|_| {
                    GatewayError::ClientProtocol("PROXY header is not ASCII".to_string())
                })?;
                let header = parse_header(line)?;
                let remote_addr = header.source.unwrap_or(peer_addr);
                let prefix = consumed.split_off(line_end + 2);
                return Ok(ProxyProtocolStream {
                    inner: stream,
                    prefix,
                    offset: 0,
                    remote_addr,
                });
            }

            if consumed.len() >= MAX_HEADER_LENGTH {
                return Err(GatewayError::ClientProtocol(format!(
                    "PROXY header exceeds {} octets without terminator",
                    MAX_HEADER_LENGTH
                )));
            }
        }

        let want = MAX_HEADER_LENGTH - consumed.len();
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(GatewayError::ClientProtocol(
                "connection closed before PROXY header completed".to_string(),
            ));
        }
        consumed.extend_from_slice(&chunk[..n]);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "192.0.2.1:55555".parse().unwrap()
    }

    #[test]
    fn test_parse_tcp4_header() {
        let header = parse_header("PROXY TCP4 10.0.0.5 10.0.0.6 4242 443").unwrap();
        assert_eq!(header.source, Some("10.0.0.5:4242".parse().unwrap()));
        assert_eq!(header.destination, Some("10.0.0.6:443".parse().unwrap()));
    }

    #[test]
    fn test_parse_tcp6_header() {
        let header = parse_header("PROXY TCP6 2001:db8::1 2001:db8::2 4242 443").unwrap();
        assert_eq!(header.source, Some("[2001:db8::1]:4242".parse().unwrap()));
    }

    #[test]
    fn test_parse_unknown_header() {
        let header = parse_header("PROXY UNKNOWN").unwrap();
        assert_eq!(header.source, None);
        let header = parse_header("PROXY UNKNOWN ffff::1 ffff::2 1 2").unwrap();
        assert_eq!(header.source, None);
    }

    #[test]
    fn test_parse_rejects_malformed_headers() {
        for line in [
            "PROXY",
            "PROXY TCP4",
            "PROXY TCP4 10.0.0.5",
            "PROXY TCP4 nonsense 10.0.0.6 1 2",
            "PROXY TCP4 10.0.0.5 10.0.0.6 99999 443",
            "PROXY TCP4 2001:db8::1 10.0.0.6 1 2",
            "PROXY TCP6 10.0.0.5 10.0.0.6 1 2",
            "PROXY TCP4 10.0.0.5 10.0.0.6 1 2 extra",
            "NOXRP TCP4 10.0.0.5 10.0.0.6 1 2",
        ] {
            assert!(parse_header(line).is_err(), "should reject {:?}", line);
        }
    }

    #[tokio::test]
    async fn test_accept_parses_header_and_replays_payload() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"PROXY TCP4 10.0.0.5 10.0.0.6 4242 443\r\n\x16\x03\x01tls-bytes")
            .await
            .unwrap();

        let mut wrapped = accept(server, peer()).await.unwrap();
        assert_eq!(wrapped.remote_addr(), "10.0.0.5:4242".parse().unwrap());

        let mut payload = vec![0u8; 12];
        wrapped.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"\x16\x03\x01tls-bytes");
    }

    #[tokio::test]
    async fn test_accept_replays_non_proxy_bytes_untouched() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut wrapped = accept(server, peer()).await.unwrap();
        assert_eq!(wrapped.remote_addr(), peer());

        let mut replayed = vec![0u8; 18];
        wrapped.read_exact(&mut replayed).await.unwrap();
        assert_eq!(&replayed, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_accept_decides_early_on_short_non_proxy_prefix() {
        // Two bytes that already rule out "PROXY " must not wait for more.
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x16\x03").await.unwrap();

        let mut wrapped = accept(server, peer()).await.unwrap();
        let mut replayed = vec![0u8; 2];
        wrapped.read_exact(&mut replayed).await.unwrap();
        assert_eq!(&replayed, b"\x16\x03");
    }

    #[tokio::test]
    async fn test_accept_rejects_oversized_header() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut oversized = b"PROXY TCP4 ".to_vec();
        oversized.extend(std::iter::repeat(b'1').take(120));
        client.write_all(&oversized).await.unwrap();

        assert!(accept(server, peer()).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_rejects_malformed_line() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"PROXY TCP4 bogus bogus 1 2\r\n")
            .await
            .unwrap();

        assert!(accept(server, peer()).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_unknown_keeps_peer_address() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"PROXY UNKNOWN\r\npayload")
            .await
            .unwrap();

        let mut wrapped = accept(server, peer()).await.unwrap();
        assert_eq!(wrapped.remote_addr(), peer());

        let mut payload = vec![0u8; 7];
        wrapped.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"payload");
    }

    #[tokio::test]
    async fn test_accept_rejects_eof_mid_header() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"PROXY TCP4 10.0").await.unwrap();
        drop(client);

        assert!(accept(server, peer()).await.is_err());
    }
}
