//! At-rest message envelope.
//!
//! Outbound `APPEND` bodies are sealed into an armored envelope before
//! they reach the upstream server; inbound `FETCH` bodies carrying the
//! armor are opened before they reach the client. Mail that predates
//! the gateway is not armored and passes through untouched.
//!
//! Armor layout:
//!
//! ```text
//! -----BEGIN CITM MESSAGE-----
//! <base64 of nonce || ChaCha20-Poly1305 ciphertext, 76-col lines>
//! -----END CITM MESSAGE-----
//! ```

use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

const HEADER: &str = "-----BEGIN CITM MESSAGE-----";
const FOOTER: &str = "-----END CITM MESSAGE-----";
const ARMOR_COLS: usize = 76;
const NONCE_LEN: usize = 12;

/// Whether `data` carries the envelope armor.
#[must_use]
pub fn is_envelope(data: &[u8]) -> bool {
    data.starts_with(HEADER.as_bytes())
}

/// Seal `plaintext` into an armored envelope.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Internal("envelope seal failed".into()))?;

    let mut armored = Vec::with_capacity(nonce.len() + ciphertext.len());
    armored.extend_from_slice(&nonce);
    armored.extend_from_slice(&ciphertext);
    let encoded = B64.encode(&armored);

    let mut out = Vec::with_capacity(encoded.len() + 64);
    out.extend_from_slice(HEADER.as_bytes());
    out.extend_from_slice(b"\r\n");
    for line in encoded.as_bytes().chunks(ARMOR_COLS) {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(FOOTER.as_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Open an armored envelope. Fails on missing armor, bad base64, or an
/// authentication failure.
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::Internal("envelope is not ASCII armor".into()))?;
    let body = text
        .strip_prefix(HEADER)
        .ok_or_else(|| Error::Internal("missing envelope header".into()))?;
    let end = body
        .find(FOOTER)
        .ok_or_else(|| Error::Internal("missing envelope footer".into()))?;
    let encoded: String = body[..end].chars().filter(|c| !c.is_whitespace()).collect();

    let armored = B64
        .decode(encoded)
        .map_err(|e| Error::Internal(format!("envelope base64: {e}")))?;
    if armored.len() < NONCE_LEN {
        return Err(Error::Internal("envelope too short".into()));
    }
    let (nonce, ciphertext) = armored.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Internal("envelope authentication failed".into()))
}

/// Rebuild a BODYSTRUCTURE item for a (decrypted) message so that
/// display and search semantics downstream match the cleartext.
pub fn bodystructure(raw: &[u8]) -> Result<String> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| Error::Internal(format!("parse message: {e}")))?;
    Ok(render_part(&parsed))
}

fn render_part(part: &mailparse::ParsedMail<'_>) -> String {
    if !part.subparts.is_empty() {
        let children: String = part.subparts.iter().map(render_part).collect();
        let subtype = part
            .ctype
            .mimetype
            .split_once('/')
            .map_or("MIXED", |(_, s)| s)
            .to_uppercase();
        return format!("({children} \"{subtype}\")");
    }

    let (typ, subtype) = part
        .ctype
        .mimetype
        .split_once('/')
        .map_or(("TEXT", "PLAIN"), |(t, s)| (t, s));
    let typ = typ.to_uppercase();
    let subtype = subtype.to_uppercase();
    let charset = part.ctype.charset.to_uppercase();
    let encoding = part
        .headers
        .iter()
        .find(|h| h.get_key_ref().eq_ignore_ascii_case("content-transfer-encoding"))
        .map_or_else(|| "7BIT".to_string(), |h| h.get_value().to_uppercase());

    let body = part.get_body_raw().unwrap_or_default();
    let size = body.len();
    if typ == "TEXT" {
        let lines = body.iter().filter(|&&b| b == b'\n').count();
        format!(
            "(\"{typ}\" \"{subtype}\" (\"CHARSET\" \"{charset}\") NIL NIL \"{encoding}\" {size} {lines})"
        )
    } else {
        format!("(\"{typ}\" \"{subtype}\" NIL NIL NIL \"{encoding}\" {size})")
    }
}

/// Replace the parenthesized expression following a `BODYSTRUCTURE`
/// attribute keyword inside a FETCH attribute string. Returns `None`
/// when the text carries no such expression.
#[must_use]
pub fn replace_bodystructure(text: &str, replacement: &str) -> Option<String> {
    let upper = text.to_uppercase();
    let key_at = upper.find("BODYSTRUCTURE")?;
    let after = key_at + "BODYSTRUCTURE".len();
    let open_rel = text[after..].find('(')?;
    // Only whitespace may separate the keyword from its value.
    if text[after..after + open_rel].bytes().any(|b| b != b' ') {
        return None;
    }
    let open = after + open_rel;

    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let close = open + i;
                    return Some(format!(
                        "{}{replacement}{}",
                        &text[..open],
                        &text[close + 1..]
                    ));
                }
            }
            _ => {}
        }
    }
    None
}
