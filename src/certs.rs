//! Root authority management and per-host leaf certificate issuance.

use std::{
    collections::HashMap,
    io::BufReader,
    net::IpAddr,
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tokio_rustls::rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use tracing::{debug, info};

const ROOT_COMMON_NAME: &str = "Passeur Local Root";
const ROOT_ORGANIZATION: &str = "Passeur";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate generation failed: {0}")]
    GenerationError(#[from] rcgen::Error),
    #[error("Failed during I/O: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Invalid root material: {0}")]
    InvalidMaterial(String),
    #[error("TLS configuration rejected the issued certificate: {0}")]
    TlsConfigError(#[from] tokio_rustls::rustls::Error),
    #[error("Issuer unavailable")]
    IssuerUnavailable,
}

/// A leaf certificate ready to be presented by a TLS listener.
#[derive(Clone)]
pub struct IssuedCertificate {
    pub leaf: CertificateDer<'static>,
    pub server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("leaf_len", &self.leaf.len())
            .finish()
    }
}

/// Issues a certificate for a hostname or an IP literal.
///
/// Implementations may be called concurrently for the same host; callers that
/// need a single issuance per host deduplicate on their side.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn issue(&self, host: &str) -> Result<IssuedCertificate, CertificateError>;
}

struct AuthorityInner {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    leaves: Mutex<HashMap<String, IssuedCertificate>>,
}

/// The locally trusted root, signing one leaf per host and caching it.
#[derive(Clone)]
pub struct RootAuthority {
    inner: Arc<AuthorityInner>,
}

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;
    params
}

fn leaf_params(host: &str) -> Result<CertificateParams, CertificateError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    match host.parse::<IpAddr>() {
        Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
        Err(_) => params.subject_alt_names.push(SanType::DnsName(host.try_into()?)),
    }

    Ok(params)
}

fn write_with_parents(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, contents)
}

impl RootAuthority {
    fn from_parts(
        issuer: Issuer<'static, KeyPair>,
        cert_der: CertificateDer<'static>,
        cert_pem: String,
        key_pem: String,
    ) -> Self {
        Self {
            inner: Arc::new(AuthorityInner {
                issuer,
                cert_der,
                cert_pem,
                key_pem,
                leaves: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn exists(cert_path: &Path, key_path: &Path) -> bool {
        cert_path.is_file() && key_path.is_file()
    }

    pub fn generate() -> Result<Self, CertificateError> {
        let key = KeyPair::generate()?;
        let params = root_params();
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        let cert_der = cert.der().clone();

        Ok(Self::from_parts(Issuer::new(params, key), cert_der, cert_pem, key_pem))
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;

        let cert_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .next()
            .ok_or_else(|| CertificateError::InvalidMaterial(format!("no certificate in {}", cert_path.display())))??;
        let key = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key)?;

        Ok(Self::from_parts(issuer, cert_der, cert_pem, key_pem))
    }

    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<(), CertificateError> {
        write_with_parents(cert_path, &self.inner.cert_pem)?;
        write_with_parents(key_path, &self.inner.key_pem)?;
        Ok(())
    }

    /// Loads the root from disk, generating and persisting a new one when absent.
    /// The boolean is true when a new root was generated.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<(Self, bool), CertificateError> {
        if Self::exists(cert_path, key_path) {
            return Ok((Self::load(cert_path, key_path)?, false));
        }

        let authority = Self::generate()?;
        authority.save(cert_path, key_path)?;
        info!("Generated a new root authority at {}", cert_path.display());
        Ok((authority, true))
    }

    pub fn trust_instructions(cert_path: &Path) -> String {
        format!(
            "Intercepted HTTPS traffic is signed by {path}. Add it to the trust store of your \
             system or browser, for example `sudo cp {path} /usr/local/share/ca-certificates/passeur.crt \
             && sudo update-ca-certificates` on Debian-based systems, or Keychain Access on macOS.",
            path = cert_path.display()
        )
    }

    #[cfg(test)]
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.inner.cert_der
    }

    fn sign_leaf(inner: &AuthorityInner, host: &str) -> Result<IssuedCertificate, CertificateError> {
        let params = leaf_params(host)?;
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &inner.issuer)?;
        let leaf = cert.der().clone();

        let chain = vec![leaf.clone(), inner.cert_der.clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(IssuedCertificate {
            leaf,
            server_config: Arc::new(server_config),
        })
    }
}

#[async_trait]
impl CertificateProvider for RootAuthority {
    async fn issue(&self, host: &str) -> Result<IssuedCertificate, CertificateError> {
        if let Some(issued) = self.inner.leaves.lock().get(host) {
            return Ok(issued.clone());
        }

        debug!("Signing a leaf certificate for {host}");
        let inner = self.inner.clone();
        let owned_host = host.to_owned();
        let issued = tokio::task::spawn_blocking(move || Self::sign_leaf(&inner, &owned_host))
            .await
            .map_err(|_| CertificateError::IssuerUnavailable)??;

        self.inner.leaves.lock().insert(host.to_owned(), issued.clone());
        Ok(issued)
    }
}
