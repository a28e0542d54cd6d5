//! HTTP request forwarding.
//!
//! Relays a request to the selected upstream through the shared client,
//! preserving the client's Host header and streaming the response body
//! straight through so server-sent events flush immediately.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use reqwest::Client;
use tokio::time::timeout;
use tracing::warn;

use crate::route::Route;

/// Budget for the upstream to produce response headers. The body itself is
/// unconstrained so long-lived streams keep working.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers, stripped in both directions.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Forward one request and return the upstream's response.
///
/// Any upstream failure maps to `502 Bad Gateway` with a single log line;
/// client disconnects cancel this future before a response exists, so they
/// produce neither.
pub async fn forward(
    client: &Client,
    route: &Route,
    req: Request,
    listener_scheme: &'static str,
) -> Response {
    let (parts, body) = req.into_parts();

    let mut url = route.upstream().clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let client_host = parts.headers.get(header::HOST).cloned();

    let mut headers = parts.headers.clone();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    // hyper reframes the body itself.
    headers.remove(header::CONTENT_LENGTH);
    // The client's Host rides through unchanged: downstream services rely
    // on virtual hosting and request validation.
    if let Some(host) = &client_host {
        headers.insert(header::HOST, host.clone());
    }
    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = client_host {
            headers.insert("x-forwarded-host", host);
        }
    }
    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static(listener_scheme));
    }

    let request = client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream_response = match timeout(RESPONSE_HEADER_TIMEOUT, request.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(upstream = %route.upstream(), error = %e, "upstream request failed");
            return bad_gateway();
        }
        Err(_) => {
            warn!(upstream = %route.upstream(), "upstream did not produce response headers in time");
            return bad_gateway();
        }
    };

    let mut builder = Response::builder().status(upstream_response.status());
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in upstream_response.headers() {
            if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                response_headers.append(name.clone(), value.clone());
            }
        }
    }

    let stream = upstream_response.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| bad_gateway())
}

#[must_use]
pub fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

#[must_use]
pub fn no_matching_route() -> Response {
    (StatusCode::BAD_GATEWAY, "No matching route").into_response()
}
