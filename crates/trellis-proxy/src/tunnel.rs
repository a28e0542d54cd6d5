//! WebSocket upgrade tunneling.
//!
//! An `Upgrade: websocket` request is not proxied through the HTTP client:
//! the target's host:port is dialed directly, the original handshake is
//! serialized onto that socket, the upstream's switching response is
//! mirrored to the client, and from then on raw bytes are copied in both
//! directions. Frames are never parsed.
//!
//! When one direction finishes, `copy_bidirectional` write-shuts the other
//! side so the peer drains; both sockets are fully closed before the
//! tunnel task ends.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{Response as HttpResponse, StatusCode, header};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::forward::bad_gateway;
use crate::route::Route;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on the upstream handshake response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Case-insensitive `Upgrade: websocket` detection.
#[must_use]
pub fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Tunnel one upgrade request to the route's upstream.
pub async fn tunnel(route: &Route, mut req: Request) -> Response {
    let authority = route.upstream_authority();

    let mut upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&authority)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(upstream = %authority, error = %e, "websocket upstream dial failed");
            return bad_gateway();
        }
        Err(_) => {
            warn!(upstream = %authority, "websocket upstream dial timed out");
            return bad_gateway();
        }
    };

    // Claim the client connection before the request is torn apart; the
    // upgrade completes once the 101 response below has been written.
    let client_upgrade = hyper::upgrade::on(&mut req);

    if let Err(e) = upstream.write_all(&serialize_request_head(&req)).await {
        warn!(upstream = %authority, error = %e, "failed to relay websocket handshake");
        return bad_gateway();
    }

    let (head_bytes, leftover) = match read_response_head(&mut upstream).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(upstream = %authority, error = %e, "failed to read websocket handshake response");
            return bad_gateway();
        }
    };
    let Some(mut response) = parse_response_head(&head_bytes) else {
        warn!(upstream = %authority, "unparsable websocket handshake response");
        return bad_gateway();
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // The upstream declined the upgrade; its answer goes back verbatim,
        // with whatever body bytes arrived alongside the head, and the
        // connection is dropped.
        debug!(upstream = %authority, status = %response.status(), "upstream declined websocket upgrade");
        *response.body_mut() = axum::body::Body::from(leftover);
        return response;
    }

    info!(upstream = %authority, "websocket tunnel established");
    tokio::spawn(async move {
        match client_upgrade.await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                // Bytes the upstream sent past its response head belong to
                // the tunneled stream.
                if !leftover.is_empty() {
                    if let Err(e) = client_io.write_all(&leftover).await {
                        debug!(error = %e, "failed to flush buffered tunnel bytes");
                        return;
                    }
                }
                match copy_bidirectional(&mut client_io, &mut upstream).await {
                    Ok((to_upstream, to_client)) => {
                        debug!(to_upstream, to_client, "websocket tunnel drained");
                    }
                    Err(e) => debug!(error = %e, "websocket tunnel ended with error"),
                }
                let _ = client_io.shutdown().await;
                let _ = upstream.shutdown().await;
            }
            Err(e) => debug!(error = %e, "client upgrade failed"),
        }
    });

    // Mirror the upstream's 101 (already built above) to the client; hyper
    // hands the connection to the tunnel task once it is on the wire.
    response
}

/// Serialize the original request line and headers, Upgrade headers
/// included, for the upstream handshake.
fn serialize_request_head(req: &Request) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Read from the upstream until the end of the response head. Returns the
/// head bytes and whatever tunneled bytes were read past it.
async fn read_response_head(upstream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed during handshake",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "handshake response head too large",
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Minimal parse of the status line and headers into an empty-bodied
/// response. Returns `None` when the head is not HTTP-shaped.
fn parse_response_head(head: &[u8]) -> Option<Response> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let status_line = lines.next()?;
    let code: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;

    let mut builder = HttpResponse::builder().status(StatusCode::from_u16(code).ok()?);
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            builder = builder.header(name.trim(), value.trim());
        }
    }
    builder
        .body(Body::empty())
        .map_or_else(|_| None, |resp| Some(resp.into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 X\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"HTTP/1.1 101 X\r\n"), None);
    }

    #[test]
    fn response_head_parses_status_and_headers() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let resp = parse_response_head(head).unwrap();
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            resp.headers().get(header::UPGRADE).unwrap().to_str().unwrap(),
            "websocket"
        );
    }

    #[test]
    fn garbage_head_is_rejected() {
        assert!(parse_response_head(b"not http at all\r\n\r\n").is_none());
    }

    #[test]
    fn request_head_serialization_preserves_upgrade_headers() {
        let req = Request::builder()
            .method("GET")
            .uri("/socket?x=1")
            .header("Host", "example.test")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .body(Body::empty())
            .unwrap();
        let head = String::from_utf8(serialize_request_head(&req)).unwrap();
        assert!(head.starts_with("GET /socket?x=1 HTTP/1.1\r\n"));
        assert!(head.contains("upgrade: websocket\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }
}
