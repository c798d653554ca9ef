//! Gateway configuration
//!
//! Listen and remote endpoints are written as URLs: `imap://` for
//! cleartext, `imap+starttls://` for STARTTLS, `imaps://` for implicit
//! TLS. Default ports follow the scheme (143 / 143 / 993).

use crate::connection::Security;
use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use url::Url;

/// One listen or remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrSpec {
    pub security: Security,
    pub host: String,
    pub port: u16,
}

impl AddrSpec {
    /// Parse an endpoint URL such as `imaps://mail.example.com:993`.
    pub fn parse(spec: &str) -> Result<Self> {
        let url =
            Url::parse(spec).map_err(|e| Error::Config(format!("invalid spec {spec:?}: {e}")))?;
        let (security, default_port) = match url.scheme() {
            "imap" => (Security::Plain, 143),
            "imap+starttls" => (Security::StartTls, 143),
            "imaps" => (Security::Tls, 993),
            other => {
                return Err(Error::Config(format!(
                    "unknown scheme {other:?} in {spec:?}"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("missing host in {spec:?}")))?
            .to_string();
        Ok(Self {
            security,
            host,
            port: url.port().unwrap_or(default_port),
        })
    }
}

impl std::fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.security {
            Security::Plain => "imap",
            Security::StartTls => "imap+starttls",
            Security::Tls => "imaps",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Everything the gateway harness needs to run.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listens: Vec<AddrSpec>,
    pub remote: AddrSpec,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub maildir_root: PathBuf,
    /// Keysync API base, e.g. `https://keys.example.com/api/`.
    pub api: Url,
    /// Skip upstream certificate verification (self-signed upstreams).
    pub trust_upstream: bool,
    /// Print a ready line once all listeners are bound, for service
    /// supervisors.
    pub indicate_ready: bool,
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `CITM_REMOTE`
    /// - `CITM_API`
    ///
    /// Optional (with defaults):
    /// - `CITM_LISTEN` (default: `imap://127.0.0.1:1143`, comma-separated)
    /// - `CITM_KEY` / `CITM_CERT` (default: `citm.key` / `citm.cert`)
    /// - `CITM_MAILDIR_ROOT` (default: `./maildir`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let listens = env::var("CITM_LISTEN")
            .unwrap_or_else(|_| "imap://127.0.0.1:1143".to_string())
            .split(',')
            .map(|s| AddrSpec::parse(s.trim()))
            .collect::<Result<Vec<_>>>()?;
        if listens.is_empty() {
            return Err(Error::Config("no listen specs".into()));
        }

        let remote = AddrSpec::parse(
            &env::var("CITM_REMOTE").map_err(|_| Error::Config("CITM_REMOTE not set".into()))?,
        )?;
        let api = Url::parse(
            &env::var("CITM_API").map_err(|_| Error::Config("CITM_API not set".into()))?,
        )
        .map_err(|e| Error::Config(format!("invalid CITM_API: {e}")))?;

        Ok(Self {
            listens,
            remote,
            key: env::var("CITM_KEY").unwrap_or_else(|_| "citm.key".into()).into(),
            cert: env::var("CITM_CERT").unwrap_or_else(|_| "citm.cert".into()).into(),
            maildir_root: env::var("CITM_MAILDIR_ROOT")
                .unwrap_or_else(|_| "./maildir".into())
                .into(),
            api,
            trust_upstream: env::var("CITM_TRUST_UPSTREAM").is_ok_and(|v| v == "1"),
            indicate_ready: false,
        })
    }
}
