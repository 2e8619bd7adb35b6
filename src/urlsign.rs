//! Authenticated URL signing.
//!
//! Turns absolute URLs into opaque ids that are safe to hand to
//! untrusted clients and accept back: XChaCha20-Poly1305 under a
//! process-random 256-bit key, a fresh 24-byte nonce per id, encoded
//! as base64url(nonce ∥ ciphertext ∥ tag) without padding. The key is
//! never persisted, so ids die with the process; they only need to
//! survive a single boot session.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, OsRng};
use chacha20poly1305::{AeadCore, Key, KeyInit, XChaCha20Poly1305, XNonce};

use crate::domain::FileId;
use crate::error::SignError;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Fresh random signing key.
pub fn generate_key() -> [u8; KEY_LEN] {
    XChaCha20Poly1305::generate_key(&mut OsRng).into()
}

/// Seal `url` into an opaque id under `key`.
pub fn sign_url(url: &str, key: &[u8; KEY_LEN]) -> Result<FileId, SignError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, url.as_bytes())
        .map_err(|_| SignError::Invalid)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(FileId(URL_SAFE_NO_PAD.encode(out)))
}

/// Recover the URL from an id minted by [`sign_url`] with the same
/// key. Truncated, tampered, or foreign-key ids all fail.
pub fn get_url(id: &FileId, key: &[u8; KEY_LEN]) -> Result<String, SignError> {
    let raw = URL_SAFE_NO_PAD
        .decode(id.as_str())
        .map_err(|_| SignError::Invalid)?;
    if raw.len() <= NONCE_LEN {
        return Err(SignError::Invalid);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(&raw[..NONCE_LEN]);
    let plain = cipher
        .decrypt(nonce, &raw[NONCE_LEN..])
        .map_err(|_| SignError::Verification)?;

    String::from_utf8(plain).map_err(|_| SignError::Verification)
}
