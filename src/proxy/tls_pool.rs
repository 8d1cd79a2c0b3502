//! Local TLS listeners terminating intercepted connections.
//!
//! Every hostname is served by one shared listener that picks its
//! certificate from the SNI of each ClientHello. IP literals cannot be
//! routed by SNI and get a listener of their own with a fixed certificate.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    task::{AbortHandle, JoinSet},
};
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor, rustls::server::Acceptor, server::TlsStream};
use tracing::{debug, info, warn};

use crate::{
    certs::{CertificateError, CertificateProvider, IssuedCertificate},
    memoize::{MemoizedTaskRunner, TaskError},
};

const SNI_LISTENER_KEY: &str = "*sni*";

/// Receives every decrypted connection of a pooled listener.
pub type TlsHandler = Arc<dyn Fn(TlsStream<TcpStream>, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum TlsPoolError {
    #[error("Failed to bind a local TLS listener: {0}")]
    BindError(Arc<io::Error>),
    #[error("Certificate issuance failed: {0}")]
    CertificateError(Arc<CertificateError>),
    #[error("TLS pool is closed")]
    Closed,
    #[error("Listener creation was abandoned")]
    Abandoned,
}

impl From<TaskError<TlsPoolError>> for TlsPoolError {
    fn from(error: TaskError<TlsPoolError>) -> Self {
        match error {
            TaskError::Failed(e) => e,
            TaskError::Abandoned => TlsPoolError::Abandoned,
        }
    }
}

type IssuedRunner = MemoizedTaskRunner<IssuedCertificate, Arc<CertificateError>>;

pub struct TlsPool {
    servers: MemoizedTaskRunner<SocketAddr, TlsPoolError>,
    issued: Arc<IssuedRunner>,
    provider: Arc<dyn CertificateProvider>,
    listeners: Arc<Mutex<Vec<AbortHandle>>>,
    closed: Arc<AtomicBool>,
}

async fn issue_once(
    issued: &IssuedRunner,
    provider: Arc<dyn CertificateProvider>,
    host: &str,
) -> Result<IssuedCertificate, TlsPoolError> {
    let owned = host.to_owned();
    issued
        .run(host, async move { provider.issue(&owned).await.map_err(Arc::new) })
        .await
        .map_err(|e| match e {
            TaskError::Failed(e) => TlsPoolError::CertificateError(e),
            TaskError::Abandoned => TlsPoolError::Abandoned,
        })
}

impl TlsPool {
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self {
            servers: MemoizedTaskRunner::new(),
            issued: Arc::new(MemoizedTaskRunner::new()),
            provider,
            listeners: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the loopback address of the listener terminating TLS for
    /// `hostname`, creating it on first use. `handler` is only used by the
    /// call that creates the listener.
    pub async fn get_server(&self, hostname: &str, handler: TlsHandler) -> Result<SocketAddr, TlsPoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TlsPoolError::Closed);
        }

        let host = hostname.trim_start_matches('[').trim_end_matches(']');
        let ip = host.parse::<IpAddr>().ok();
        let key = match ip {
            Some(ip) => ip.to_string(),
            None => SNI_LISTENER_KEY.to_owned(),
        };

        let listeners = self.listeners.clone();
        let closed = self.closed.clone();
        let issued = self.issued.clone();
        let provider = self.provider.clone();

        let addr = self
            .servers
            .run(&key, async move {
                let acceptor = match ip {
                    Some(ip) => {
                        let certificate = issue_once(&issued, provider, &ip.to_string()).await?;
                        ListenerKind::Fixed(TlsAcceptor::from(certificate.server_config))
                    }
                    None => ListenerKind::Sni { issued, provider },
                };

                let listener = TcpListener::bind("127.0.0.1:0")
                    .await
                    .map_err(|e| TlsPoolError::BindError(Arc::new(e)))?;
                let addr = listener.local_addr().map_err(|e| TlsPoolError::BindError(Arc::new(e)))?;

                let mut registered = listeners.lock();
                if closed.load(Ordering::SeqCst) {
                    return Err(TlsPoolError::Closed);
                }
                let task = tokio::spawn(serve_listener(listener, acceptor, handler));
                registered.push(task.abort_handle());
                info!("TLS listener for {} ready on {addr}", ip.map_or("SNI hosts".to_owned(), |ip| ip.to_string()));
                Ok(addr)
            })
            .await?;

        Ok(addr)
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Aborts every listener and the connections they accepted.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles: Vec<AbortHandle> = self.listeners.lock().drain(..).collect();
        debug!(
            "Closing {} TLS listeners serving {} certificates",
            handles.len(),
            self.issued.len()
        );
        for handle in handles {
            handle.abort();
        }
    }
}

enum ListenerKind {
    Fixed(TlsAcceptor),
    Sni {
        issued: Arc<IssuedRunner>,
        provider: Arc<dyn CertificateProvider>,
    },
}

async fn serve_listener(listener: TcpListener, kind: ListenerKind, handler: TlsHandler) {
    let kind = Arc::new(kind);
    // Owned here so aborting the listener also aborts its connections.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("TLS listener accept failed: {e}");
                        continue;
                    }
                };
                let kind = kind.clone();
                let handler = handler.clone();
                connections.spawn(async move {
                    match handshake(&kind, socket).await {
                        Ok(Some(stream)) => handler(stream, peer).await,
                        Ok(None) => {}
                        Err(e) => debug!("TLS handshake from {peer} failed: {e}"),
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handshake(kind: &ListenerKind, socket: TcpStream) -> io::Result<Option<TlsStream<TcpStream>>> {
    match kind {
        ListenerKind::Fixed(acceptor) => acceptor.accept(socket).await.map(Some),
        ListenerKind::Sni { issued, provider } => {
            let start = LazyConfigAcceptor::new(Acceptor::default(), socket).await?;
            let Some(server_name) = start.client_hello().server_name().map(str::to_owned) else {
                debug!("Dropping a ClientHello without SNI");
                return Ok(None);
            };

            match issue_once(issued, provider.clone(), &server_name).await {
                Ok(certificate) => start.into_stream(certificate.server_config).await.map(Some),
                Err(e) => {
                    warn!("No certificate for {server_name}: {e}");
                    Ok(None)
                }
            }
        }
    }
}
