//! One proxy listener: a bound address plus its compiled route table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use rustls::server::ResolvesServerCert;
use tokio_util::sync::CancellationToken;
use tracing::info;

use trellis_core::config::{ProxyListenerSpec, TlsSpec};
use trellis_core::error::ProxyBuildError;

use crate::route::RouteTable;
use crate::{forward, tls, tunnel};

/// In-flight requests get this long after a shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Requests at or above this latency get an access-log line.
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ListenerCtx {
    routes: Arc<RouteTable>,
    client: reqwest::Client,
    scheme: &'static str,
}

/// A compiled listener, ready to serve. Routes are immutable from here on,
/// so the per-request path takes no locks.
pub struct ProxyListener {
    addr: SocketAddr,
    routes: Arc<RouteTable>,
    tls: Option<RustlsConfig>,
    client: reqwest::Client,
}

impl ProxyListener {
    /// Compile a listener spec. Bad regexes, bad upstreams, an unloadable
    /// key pair, or managed TLS without a resolver all fail the build.
    pub async fn build(
        spec: &ProxyListenerSpec,
        cert_resolver: Option<Arc<dyn ResolvesServerCert>>,
        client: reqwest::Client,
    ) -> Result<Self, ProxyBuildError> {
        let addr: SocketAddr =
            spec.listen
                .parse()
                .map_err(|e: std::net::AddrParseError| ProxyBuildError::InvalidListenAddr {
                    addr: spec.listen.clone(),
                    message: e.to_string(),
                })?;
        let routes = Arc::new(RouteTable::build(&spec.routes)?);
        let tls = match &spec.tls {
            TlsSpec::None => None,
            TlsSpec::CertKey {
                cert_path,
                key_path,
            } => Some(tls::cert_key_config(cert_path, key_path).await?),
            TlsSpec::Managed => {
                let resolver =
                    cert_resolver.ok_or_else(|| ProxyBuildError::MissingCertResolver {
                        listen: spec.listen.clone(),
                    })?;
                Some(tls::managed_config(resolver))
            }
        };
        Ok(Self {
            addr,
            routes,
            tls,
            client,
        })
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Serve until the token is cancelled, then drain gracefully.
    pub async fn serve(self, handle: Handle, cancel: CancellationToken) -> std::io::Result<()> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let ctx = ListenerCtx {
            routes: self.routes,
            client: self.client,
            scheme,
        };
        let app = Router::new().fallback(dispatch).with_state(ctx);

        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        info!(addr = %self.addr, %scheme, "proxy listener starting");
        match self.tls {
            Some(config) => {
                axum_server::bind_rustls(self.addr, config)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
            }
            None => {
                axum_server::bind(self.addr)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
            }
        }
    }
}

async fn dispatch(State(ctx): State<ListenerCtx>, req: Request) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = route_request(&ctx, req).await;

    // One INFO line for anything slow or broken. A cancelled client drops
    // this future before it gets here, so those stay silent.
    let latency = started.elapsed();
    let status = response.status();
    if latency >= SLOW_REQUEST_THRESHOLD || status.as_u16() >= 500 {
        info!(
            %method,
            %path,
            status = status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            "proxy request"
        );
    }
    response
}

async fn route_request(ctx: &ListenerCtx, req: Request) -> Response {
    let Some(route) = ctx.routes.select(req.uri().path()) else {
        return forward::no_matching_route();
    };
    if tunnel::is_websocket_upgrade(req.headers()) {
        tunnel::tunnel(route, req).await
    } else {
        forward::forward(&ctx.client, route, req, ctx.scheme).await
    }
}
