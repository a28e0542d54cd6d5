//! The listener set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use rustls::server::ResolvesServerCert;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use trellis_core::config::ProxyListenerSpec;
use trellis_core::error::ProxyBuildError;

use crate::listener::ProxyListener;
use crate::tls;

/// Owns every configured listener: compiles them up front, runs each in
/// its own worker, and aggregates shutdown.
pub struct ProxyManager {
    listeners: Vec<ProxyListener>,
    handles: Vec<Handle>,
    workers: Vec<JoinHandle<std::io::Result<()>>>,
    cancel: CancellationToken,
}

impl ProxyManager {
    /// Compile the whole listener set. Any configuration error fails the
    /// build; nothing is bound yet.
    pub async fn build(
        specs: &[ProxyListenerSpec],
        cert_resolver: Option<Arc<dyn ResolvesServerCert>>,
    ) -> Result<Self, ProxyBuildError> {
        tls::ensure_crypto_provider();

        // One shared client: per-host idle pool, connect timeout, keepalive.
        // A reverse proxy must hand redirects back to the client untouched.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyBuildError::HttpClient(e.to_string()))?;

        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            listeners.push(ProxyListener::build(spec, cert_resolver.clone(), client.clone()).await?);
        }
        Ok(Self {
            listeners,
            handles: Vec::new(),
            workers: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Bring up each listener in its own worker.
    pub fn start(&mut self) {
        for listener in self.listeners.drain(..) {
            let handle = Handle::new();
            self.handles.push(handle.clone());
            let cancel = self.cancel.clone();
            self.workers.push(tokio::spawn(listener.serve(handle, cancel)));
        }
    }

    /// Bound addresses once the listeners are up. Resolves `:0` listen
    /// specs to their real ports.
    pub async fn addresses(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            if let Some(addr) = handle.listening().await {
                addrs.push(addr);
            }
        }
        addrs
    }

    /// Gracefully shut down every listener. The first error is returned,
    /// the rest are logged.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.cancel.cancel();
        let mut first_error = None;
        for worker in self.workers.drain(..) {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(std::io::Error::other(e)),
            };
            if let Err(e) = result {
                warn!(error = %e, "proxy listener shut down with error");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        self.handles.clear();
        first_error.map_or(Ok(()), Err)
    }
}
