//! Per-user key directory.
//!
//! A [`KeyDir`] holds the device key material and the user's trusted
//! peer listing under the maildir root. The relay treats it as a black
//! box: preuser opens it and fills in the peer list from keysync, the
//! user stage derives the message envelope key from it. The trait is
//! the seam tests fake.

use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// One entry in the authoritative peer listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKey {
    pub fingerprint: String,
    pub public: String,
}

pub trait KeyDir: Send + Sync {
    fn user(&self) -> &str;
    /// Base64 public token for this device, as registered with the
    /// keysync endpoint.
    fn device_public(&self) -> String;
    /// Hex SHA-256 fingerprint of the device public token.
    fn fingerprint(&self) -> String;
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, data: &[u8], sig: &[u8]) -> Result<bool>;
    fn peers(&self) -> Vec<PeerKey>;
    fn set_peers(&self, peers: Vec<PeerKey>) -> Result<()>;
    /// Replace the device secret, keeping the peer list.
    fn rotate(&self) -> Result<()>;
    /// Symmetric key for the message envelope, derived from the device
    /// secret.
    fn message_key(&self) -> Result<[u8; 32]>;
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    device_secret: String,
    created: DateTime<Utc>,
    #[serde(default)]
    peers: Vec<PeerKey>,
}

impl KeyFile {
    fn fresh() -> Self {
        let mut secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut secret);
        Self {
            device_secret: B64.encode(secret),
            created: Utc::now(),
            peers: Vec::new(),
        }
    }

    fn secret(&self) -> Result<Vec<u8>> {
        B64.decode(&self.device_secret)
            .map_err(|e| Error::Internal(format!("corrupt device secret: {e}")))
    }
}

/// Filesystem-backed key directory: `<root>/<user>/keys.json`.
pub struct FsKeyDir {
    user: String,
    path: PathBuf,
    state: Mutex<KeyFile>,
}

/// Map a user id onto a directory name that cannot escape the root.
fn dir_name(user: &str) -> String {
    let name: String = user
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        format!("user-{name}_")
    } else {
        name
    }
}

/// Open (or create) the key directory for `user` under `root`.
pub fn open(user: &str, root: &Path) -> Result<FsKeyDir> {
    let dir = root.join(dir_name(user));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("keys.json");

    let state = if path.exists() {
        let raw = std::fs::read(&path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("corrupt key file {path:?}: {e}")))?
    } else {
        info!(user, "creating key directory");
        let fresh = KeyFile::fresh();
        persist(&path, &fresh)?;
        fresh
    };

    Ok(FsKeyDir {
        user: user.to_string(),
        path,
        state: Mutex::new(state),
    })
}

fn persist(path: &Path, state: &KeyFile) -> Result<()> {
    let raw = serde_json::to_vec_pretty(state)
        .map_err(|e| Error::Internal(format!("serialize key file: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn public_of(secret: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(b"citm-device-public\0");
    h.update(secret);
    B64.encode(h.finalize())
}

fn fingerprint_of(public: &str) -> String {
    let mut h = Sha256::new();
    h.update(public.as_bytes());
    let digest = h.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl KeyDir for FsKeyDir {
    fn user(&self) -> &str {
        &self.user
    }

    fn device_public(&self) -> String {
        let state = self.state.lock().expect("keydir lock");
        state.secret().map_or_else(|_| String::new(), |s| public_of(&s))
    }

    fn fingerprint(&self) -> String {
        fingerprint_of(&self.device_public())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock().expect("keydir lock");
        let secret = state.secret()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret)
            .map_err(|e| Error::Internal(format!("hmac init: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], sig: &[u8]) -> Result<bool> {
        let state = self.state.lock().expect("keydir lock");
        let secret = state.secret()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret)
            .map_err(|e| Error::Internal(format!("hmac init: {e}")))?;
        mac.update(data);
        Ok(mac.verify_slice(sig).is_ok())
    }

    fn peers(&self) -> Vec<PeerKey> {
        self.state.lock().expect("keydir lock").peers.clone()
    }

    fn set_peers(&self, peers: Vec<PeerKey>) -> Result<()> {
        let mut state = self.state.lock().expect("keydir lock");
        state.peers = peers;
        persist(&self.path, &state)
    }

    fn rotate(&self) -> Result<()> {
        let mut state = self.state.lock().expect("keydir lock");
        let peers = std::mem::take(&mut state.peers);
        *state = KeyFile::fresh();
        state.peers = peers;
        info!(user = %self.user, "rotated device key");
        persist(&self.path, &state)
    }

    fn message_key(&self) -> Result<[u8; 32]> {
        let state = self.state.lock().expect("keydir lock");
        let secret = state.secret()?;
        let mut h = Sha256::new();
        h.update(b"citm-message-key\0");
        h.update(&secret);
        Ok(h.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let mut n = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut n);
        let dir = std::env::temp_dir().join(format!("citm-keydir-{name}-{:016x}", u64::from_le_bytes(n)));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn open_creates_and_reloads() {
        let root = temp_root("reload");
        let kd = open("alice@example.com", &root).unwrap();
        let public = kd.device_public();
        assert!(!public.is_empty());

        let again = open("alice@example.com", &root).unwrap();
        assert_eq!(again.device_public(), public);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn sign_verify_roundtrip() {
        let root = temp_root("sign");
        let kd = open("alice", &root).unwrap();
        let sig = kd.sign(b"payload").unwrap();
        assert!(kd.verify(b"payload", &sig).unwrap());
        assert!(!kd.verify(b"tampered", &sig).unwrap());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn peers_persist_across_open() {
        let root = temp_root("peers");
        {
            let kd = open("bob", &root).unwrap();
            kd.set_peers(vec![PeerKey {
                fingerprint: "ff".into(),
                public: "AAAA".into(),
            }])
            .unwrap();
        }
        let kd = open("bob", &root).unwrap();
        assert_eq!(kd.peers().len(), 1);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn rotate_changes_key_keeps_peers() {
        let root = temp_root("rotate");
        let kd = open("carol", &root).unwrap();
        kd.set_peers(vec![PeerKey {
            fingerprint: "ff".into(),
            public: "AAAA".into(),
        }])
        .unwrap();
        let before = kd.device_public();
        kd.rotate().unwrap();
        assert_ne!(kd.device_public(), before);
        assert_eq!(kd.peers().len(), 1);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn hostile_user_ids_stay_inside_root() {
        assert_eq!(dir_name("../evil"), ".._evil");
        assert_eq!(dir_name("a/b"), "a_b");
    }
}
