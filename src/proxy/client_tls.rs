use std::{io, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tracing::debug;

/// This is a workaround for the restriction `only auto traits can be used as additional traits in a trait object`
pub trait OutboundStreamIo: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> OutboundStreamIo for T {}

pub type OutboundStream = Box<dyn OutboundStreamIo + Send + Unpin>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Connection to {target} failed: {source}")]
    ConnectError { target: String, source: io::Error },
    #[error("Invalid server name `{0}`")]
    InvalidServerName(String),
    #[error("Untrusted certificate presented by {host}: {source}")]
    UntrustedCertificate { host: String, source: io::Error },
    #[error("TLS handshake with {host} failed: {source}")]
    TlsError { host: String, source: io::Error },
    #[error("HTTP exchange with upstream failed: {0}")]
    HttpError(#[from] hyper::Error),
    #[error("Request has no target host")]
    MissingHost,
}

impl UpstreamError {
    pub fn is_certificate_error(&self) -> bool {
        matches!(self, UpstreamError::UntrustedCertificate { .. })
    }
}

/// Opens plain or TLS connections to origin servers. Certificates are checked
/// against the webpki roots unless the caller opts out for a request.
#[derive(Clone)]
pub struct UpstreamConnector {
    verified: TlsConnector,
    insecure: TlsConnector,
}

fn client_config(verifier: Option<Arc<dyn ServerCertVerifier>>) -> ClientConfig {
    let mut config = match verifier {
        Some(verifier) => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth(),
        None => {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

impl Default for UpstreamConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamConnector {
    pub fn new() -> Self {
        Self {
            verified: TlsConnector::from(Arc::new(client_config(None))),
            insecure: TlsConnector::from(Arc::new(client_config(Some(Arc::new(AcceptAnyServerCert))))),
        }
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        ignore_unauthorized: bool,
    ) -> Result<OutboundStream, UpstreamError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(UpstreamError::MissingHost);
        }

        let target = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let socket = TcpStream::connect(&target)
            .await
            .map_err(|source| UpstreamError::ConnectError { target: target.clone(), source })?;
        let _ = socket.set_nodelay(true);

        if !tls {
            return Ok(Box::new(socket));
        }

        let domain = ServerName::try_from(host.to_owned())
            .map_err(|_| UpstreamError::InvalidServerName(host.to_owned()))?;
        let connector = if ignore_unauthorized { &self.insecure } else { &self.verified };
        debug!("Performing a TLS connection to {target}...");

        match connector.connect(domain, socket).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(source) if is_invalid_certificate(&source) => Err(UpstreamError::UntrustedCertificate {
                host: host.to_owned(),
                source,
            }),
            Err(source) => Err(UpstreamError::TlsError {
                host: host.to_owned(),
                source,
            }),
        }
    }
}

fn is_invalid_certificate(error: &io::Error) -> bool {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|inner| matches!(inner, rustls::Error::InvalidCertificate(_)))
}

/// Used only when the user explicitly disables upstream certificate checks.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{CertificateProvider, RootAuthority};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsAcceptor;

    async fn tls_echo_server() -> u16 {
        let authority = RootAuthority::generate().unwrap();
        let issued = authority.issue("localhost").await.unwrap();
        let acceptor = TlsAcceptor::from(issued.server_config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut stream) = acceptor.accept(socket).await {
                        let mut buf = [0u8; 5];
                        if stream.read_exact(&mut buf).await.is_ok() {
                            let _ = stream.write_all(&buf).await;
                            let _ = stream.shutdown().await;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn unknown_issuer_is_reported_as_untrusted() {
        let port = tls_echo_server().await;
        let connector = UpstreamConnector::new();
        let result = connector.connect("localhost", port, true, false).await;
        assert!(matches!(result, Err(ref e) if e.is_certificate_error()));
    }

    #[tokio::test]
    async fn ignoring_unauthorized_accepts_any_certificate() {
        let port = tls_echo_server().await;
        let connector = UpstreamConnector::new();
        let mut stream = connector.connect("localhost", port, true, true).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn refused_connections_name_the_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = UpstreamConnector::new().connect("127.0.0.1", port, false, false).await;
        assert!(matches!(result, Err(UpstreamError::ConnectError { ref target, .. }) if target.ends_with(&port.to_string())));
    }
}
