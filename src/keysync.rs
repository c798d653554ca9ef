//! Keysync: out-of-band device registration and peer-list retrieval.
//!
//! The exchange is synchronous HTTPS and therefore never runs on the
//! session task; the preuser stage drives [`run_keysync`] which moves
//! the work onto the blocking worker pool. Retry policy lives in the
//! HTTP collaborator, not here.

use crate::error::{Error, Result};
use crate::keydir::{KeyDir, PeerKey};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub basic_auth: Option<(String, String)>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    /// Selected response headers, in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One blocking HTTPS request, issued from a worker context.
pub trait HttpSync: Send + Sync {
    fn request(&self, req: &HttpRequest) -> Result<HttpResponse>;
}

/// Production implementation on `reqwest`'s blocking client.
pub struct ReqwestSync {
    client: reqwest::blocking::Client,
}

impl ReqwestSync {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Keysync(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpSync for ReqwestSync {
    fn request(&self, req: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = match req.method {
            Method::Get => self.client.get(req.url.clone()),
            Method::Post => self.client.post(req.url.clone()),
        };
        if let Some((user, pass)) = &req.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        let resp = builder
            .send()
            .map_err(|e| Error::Keysync(format!("request failed: {e}")))?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| vec![("content-type".to_string(), v.to_string())])
            .unwrap_or_default();
        let body = resp
            .bytes()
            .map_err(|e| Error::Keysync(format!("read body: {e}")))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Serialize)]
struct Registration<'a> {
    user: &'a str,
    public: &'a str,
    fingerprint: &'a str,
    /// Base64 device signature over the public token, proving
    /// possession of the secret.
    signature: &'a str,
}

#[derive(Deserialize)]
struct Listing {
    peers: Vec<PeerKey>,
}

fn parse_listing(body: &[u8]) -> Result<Vec<PeerKey>> {
    let listing: Listing = serde_json::from_slice(body)
        .map_err(|e| Error::Keysync(format!("malformed peer listing: {e}")))?;
    Ok(listing.peers)
}

/// Register this device and fetch the authoritative peer listing.
///
/// Idempotent: a 409 means the device is already registered and the
/// existing listing is accepted. Mutual trust requires our own
/// fingerprint to appear in whatever listing we end up with.
pub fn keysync(
    http: &dyn HttpSync,
    keydir: &dyn KeyDir,
    api: &Url,
    pass: &str,
) -> Result<Vec<PeerKey>> {
    let url = api
        .join("keys")
        .map_err(|e| Error::Config(format!("keysync url: {e}")))?;
    let public = keydir.device_public();
    let fingerprint = keydir.fingerprint();
    let signature = B64.encode(keydir.sign(public.as_bytes())?);

    let register = HttpRequest {
        method: Method::Post,
        url: url.clone(),
        basic_auth: Some((keydir.user().to_string(), pass.to_string())),
        body: Some(
            serde_json::to_value(Registration {
                user: keydir.user(),
                public: &public,
                fingerprint: &fingerprint,
                signature: &signature,
            })
            .map_err(|e| Error::Internal(format!("serialize registration: {e}")))?,
        ),
    };
    let resp = http.request(&register)?;

    let peers = match resp.status {
        200 | 201 => parse_listing(&resp.body)?,
        409 => {
            debug!(user = %keydir.user(), "device already registered, fetching listing");
            let fetch = HttpRequest {
                method: Method::Get,
                url,
                basic_auth: Some((keydir.user().to_string(), pass.to_string())),
                body: None,
            };
            let resp = http.request(&fetch)?;
            if resp.status != 200 {
                return Err(Error::Keysync(format!(
                    "listing fetch returned {}",
                    resp.status
                )));
            }
            parse_listing(&resp.body)?
        }
        401 | 403 => {
            return Err(Error::Auth(format!(
                "registration rejected with {}",
                resp.status
            )));
        }
        status => return Err(Error::Keysync(format!("registration returned {status}"))),
    };

    if !peers.iter().any(|p| p.fingerprint == fingerprint) {
        return Err(Error::Keysync(
            "device fingerprint missing from peer listing".into(),
        ));
    }

    keydir.set_peers(peers.clone())?;
    info!(user = %keydir.user(), peers = peers.len(), "keysync complete");
    Ok(peers)
}

/// Drive [`keysync`] on the blocking worker pool.
pub async fn run_keysync(
    http: Arc<dyn HttpSync>,
    keydir: Arc<dyn KeyDir>,
    api: Url,
    pass: String,
) -> Result<Vec<PeerKey>> {
    tokio::task::spawn_blocking(move || keysync(http.as_ref(), keydir.as_ref(), &api, &pass))
        .await
        .map_err(|e| Error::Internal(format!("keysync worker died: {e}")))?
}
