//! The intercepting proxy: plain listener, CONNECT tunnels, pooled TLS
//! termination, the request pipeline and the WebSocket relay.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{RwLock, watch},
};
use tokio_rustls::server::TlsStream;
use tracing::{error, info};

use crate::{
    certs::CertificateProvider,
    config::Settings,
    recorder::Recorder,
    rules::Rule,
    state::State,
    throttle::{ThrottleError, ThrottleGroup},
};

pub mod context;

mod admin;
mod body;
mod client_tls;
mod decode;
mod error_page;
mod http_connect;
mod pipeline;
mod protocol_detect;
mod service;
mod socket_pool;
mod tls_pool;
mod websocket;

pub use body::{Body, BoxError};
pub use http_connect::ConnectError;
pub use pipeline::PipelineError;

use client_tls::UpstreamConnector;
use context::Scheme;
use socket_pool::SocketPool;
use tls_pool::{TlsHandler, TlsPool};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind the proxy listener on {address}: {source}")]
    BindError { address: SocketAddr, source: io::Error },
    #[error("Invalid throttle setting: {0}")]
    ThrottleError(#[from] ThrottleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Init,
    Ready,
    Closed,
}

/// Everything the connection handlers of one proxy instance share.
struct ProxyCore {
    settings: Arc<Settings>,
    state: Arc<RwLock<State>>,
    recorder: Arc<dyn Recorder>,
    tls_pool: TlsPool,
    sockets: SocketPool,
    throttle: Option<Arc<ThrottleGroup>>,
    upstream: UpstreamConnector,
    /// Where CONNECT tunnels carrying plaintext HTTP are looped back to.
    loopback_addr: SocketAddr,
    status: Mutex<ProxyStatus>,
    shutdown: watch::Sender<bool>,
}

impl ProxyCore {
    /// The rule in force when the caller starts; later reloads do not affect it.
    async fn rule(&self) -> Arc<dyn Rule> {
        self.state.read().await.rule.clone()
    }

    fn tls_handler(self: &Arc<Self>) -> TlsHandler {
        let core = self.clone();
        Arc::new(move |stream: TlsStream<TcpStream>, peer: SocketAddr| -> BoxFuture<'static, ()> {
            Box::pin(service::serve(core.clone(), stream, peer, Scheme::Https))
        })
    }

    /// Fail-fast shutdown: in-flight work is aborted, not drained.
    fn close(&self) {
        {
            let mut status = self.status.lock();
            if *status == ProxyStatus::Closed {
                return;
            }
            *status = ProxyStatus::Closed;
        }
        info!("Shutting down the proxy");
        self.sockets.close();
        self.tls_pool.close();
        self.shutdown.send_replace(true);
    }
}

fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

pub struct ProxyServer {
    core: Arc<ProxyCore>,
    listener: TcpListener,
}

/// Observes and stops a running [`ProxyServer`].
#[derive(Clone)]
pub struct ProxyHandle {
    core: Arc<ProxyCore>,
}

impl ProxyHandle {
    pub fn shutdown(&self) {
        self.core.close();
    }

    pub fn status(&self) -> ProxyStatus {
        *self.core.status.lock()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.loopback_addr
    }
}

impl ProxyServer {
    pub async fn bind(
        settings: Arc<Settings>,
        state: Arc<RwLock<State>>,
        recorder: Arc<dyn Recorder>,
        certificates: Arc<dyn CertificateProvider>,
    ) -> Result<Self, ProxyError> {
        let throttle = match settings.throttle_kbps {
            Some(kbps) => Some(Arc::new(ThrottleGroup::from_kbps(kbps)?)),
            None => None,
        };

        let address = settings.listen_address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ProxyError::BindError { address, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::BindError { address, source })?;

        let core = ProxyCore {
            settings,
            state,
            recorder,
            tls_pool: TlsPool::new(certificates),
            sockets: SocketPool::new(),
            throttle,
            upstream: UpstreamConnector::new(),
            loopback_addr: reachable(local_addr),
            status: Mutex::new(ProxyStatus::Init),
            shutdown: watch::channel(false).0,
        };
        *core.status.lock() = ProxyStatus::Ready;

        info!("Proxy listening on {local_addr}");
        if core.settings.force_no_intercept {
            info!("HTTPS interception is disabled");
        }
        if let Some(ref group) = core.throttle {
            info!("Throttling intercepted responses to {} bytes/s", group.rate());
        }

        Ok(Self {
            core: Arc::new(core),
            listener,
        })
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            core: self.core.clone(),
        }
    }

    /// Accepts connections until the proxy is shut down.
    pub async fn run(self) {
        let mut shutdown = self.core.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let _ = socket.set_nodelay(true);
                        let core = self.core.clone();
                        self.core.sockets.spawn(service::serve(core, socket, peer, Scheme::Http));
                    }
                    Err(e) => error!("Accepting a connection failed: {e}"),
                },
            }
        }

        info!("Proxy stopped");
    }
}

#[cfg(test)]
mod tests;
