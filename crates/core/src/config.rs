use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TLS_PORT: u16 = 8081;
pub const DEFAULT_DATA_DIR: &str = "data";
/// Burst capacity of every per-response token bucket
pub const DEFAULT_BURST_BYTES: u64 = 100 * 1024;
pub const DEFAULT_TAKEDOWN_URL: &str = "https://fe.staging.drmtoday.com/frontend/apis/csl/v1/";

/// Complete origin server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OriginConfig {
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Storage root; every resource path maps below it
    pub root: PathBuf,
    /// Per-reader limit in KiB/s, 0 disables throttling
    pub rate_limit_kib: u64,
    pub burst_bytes: u64,
    /// Base URL the `/takedown/` proxy forwards to
    pub takedown_url: String,
}

/// TLS listener settings
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub port: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tls: None,
            root: PathBuf::from(DEFAULT_DATA_DIR),
            rate_limit_kib: 0,
            burst_bytes: DEFAULT_BURST_BYTES,
            takedown_url: DEFAULT_TAKEDOWN_URL.to_string(),
        }
    }
}

impl OriginConfig {
    /// Rate limit in bytes per second, as consumed by the token buckets
    pub fn rate_limit_bytes(&self) -> u64 {
        self.rate_limit_kib.saturating_mul(1024)
    }
}

/// Raw TOML configuration structure.
/// Every field is optional so a file only needs to name what it overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    tls: Option<RawTls>,
    #[serde(default)]
    takedown: RawTakedown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    port: Option<u16>,
    rate_limit_kib: Option<u64>,
    burst_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorage {
    root: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTls {
    port: Option<u16>,
    cert: String,
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTakedown {
    url: Option<String>,
}

/// Parse an origin TOML file from a file path
pub fn parse_origin_toml<P: AsRef<Path>>(path: P) -> Result<OriginConfig> {
    let content = fs::read_to_string(path)?;
    parse_origin_toml_str(&content)
}

/// Parse an origin TOML document (useful for testing)
pub fn parse_origin_toml_str(content: &str) -> Result<OriginConfig> {
    let raw: RawConfig = toml::from_str(content)?;
    let defaults = OriginConfig::default();

    let root = match raw.storage.root {
        Some(root) => validate_root(&root)?,
        None => defaults.root,
    };

    let tls = raw
        .tls
        .map(|t| {
            Ok::<_, Error>(TlsConfig {
                port: t.port.unwrap_or(DEFAULT_TLS_PORT),
                cert: non_empty_path(&t.cert, "tls.cert")?,
                key: non_empty_path(&t.key, "tls.key")?,
            })
        })
        .transpose()?;

    let burst_bytes = raw.server.burst_bytes.unwrap_or(defaults.burst_bytes);
    if burst_bytes == 0 {
        return Err(Error::ConfigParse(
            "server.burst_bytes must be greater than 0".to_string(),
        ));
    }

    let takedown_url = match raw.takedown.url {
        Some(url) => validate_upstream_url(&url)?,
        None => defaults.takedown_url,
    };

    Ok(OriginConfig {
        port: raw.server.port.unwrap_or(defaults.port),
        tls,
        root,
        rate_limit_kib: raw.server.rate_limit_kib.unwrap_or(0),
        burst_bytes,
        takedown_url,
    })
}

/// Validate the storage root.
///
/// An empty root would make every request path resolve relative to the
/// process working directory, so it is rejected outright.
pub fn validate_root(root: &str) -> Result<PathBuf> {
    non_empty_path(root, "storage.root")
}

/// Pair a TLS key with its certificate.
///
/// TLS is only enabled when a key is given, and a key without a certificate
/// (or the reverse) cannot start a listener.
pub fn tls_from_parts(
    port: u16,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<Option<TlsConfig>> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some(TlsConfig { port, cert, key })),
        (None, Some(_)) => Err(Error::ConfigParse(
            "A TLS key was given without a certificate".to_string(),
        )),
        (Some(_), None) => Err(Error::ConfigParse(
            "A TLS certificate was given without a key".to_string(),
        )),
    }
}

/// Upstream base URLs must be http(s) and end with a slash so the
/// forwarded path can be appended verbatim.
pub fn validate_upstream_url(url: &str) -> Result<String> {
    let url = url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(Error::ConfigParse(format!(
            "Takedown URL must be http or https: '{}'",
            url
        )));
    }
    if url.ends_with('/') {
        Ok(url.to_string())
    } else {
        Ok(format!("{}/", url))
    }
}

fn non_empty_path(path_str: &str, field_name: &str) -> Result<PathBuf> {
    if path_str.trim().is_empty() {
        return Err(Error::ConfigParse(format!(
            "Empty path in '{}' field",
            field_name
        )));
    }
    Ok(PathBuf::from(path_str))
}
