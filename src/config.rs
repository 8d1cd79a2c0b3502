use std::{net::SocketAddr, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Response bodies growing past this size are relayed as a stream instead of being buffered.
pub const DEFAULT_CHUNK_SIZE_THRESHOLD: usize = 20 * 1024 * 1024;

const CONFIG_PATH_ENV: &str = "PASSEUR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "./passeur.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Where clients (browsers, curl, ...) connect to use the proxy.
    pub listen_address: SocketAddr,

    /// Rule file consulted by every interception hook. Reloadable at runtime.
    pub rule_file: Option<PathBuf>,

    /// Bandwidth limit shared by every throttled stream, in kilobytes per second.
    pub throttle_kbps: Option<u64>,

    /// Accept any upstream certificate, including self-signed ones.
    pub dangerously_ignore_unauthorized: bool,
    /// Tunnel every CONNECT without decrypting it, whatever the rule says.
    pub force_no_intercept: bool,

    pub chunk_size_threshold: usize,

    /// Root authority signing the per-host certificates.
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,

    /// Directory served under the inspection assets prefix.
    pub web_root: Option<PathBuf>,

    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read {path}: {source}")]
    IOError { path: PathBuf, source: std::io::Error },
    #[error("Failed to parse settings: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("throttle-kbps must be at least 1")]
    InvalidThrottle,
    #[error("chunk-size-threshold must be at least 1 byte")]
    InvalidThreshold,
}

fn certificates_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".passeur")
        .join("certificates")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([127, 0, 0, 1], 8001)),
            rule_file: None,
            throttle_kbps: None,
            dangerously_ignore_unauthorized: false,
            force_no_intercept: false,
            chunk_size_threshold: DEFAULT_CHUNK_SIZE_THRESHOLD,
            ca_cert_path: certificates_dir().join("root.crt"),
            ca_key_path: certificates_dir().join("root.key"),
            web_root: None,
            silent: false,
        }
    }
}

impl Settings {
    pub fn from_toml(contents: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::IOError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.throttle_kbps == Some(0) {
            return Err(SettingsError::InvalidThrottle);
        }
        if self.chunk_size_threshold == 0 {
            return Err(SettingsError::InvalidThreshold);
        }
        Ok(())
    }
}

/// Loads `$PASSEUR_CONFIG`, or `./passeur.toml`. A missing default file means default settings.
pub fn init() -> Result<Settings, SettingsError> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => Settings::from_file(Path::new(&path)),
        None => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            if path.exists() {
                Settings::from_file(path)
            } else {
                Ok(Settings::default())
            }
        }
    }
}
