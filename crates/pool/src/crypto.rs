// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Symmetric token codec: OAuth tokens are never persisted in the clear.
//!
//! ChaCha20-Poly1305 with a random nonce prefixed to each ciphertext. The key
//! is process-wide, loaded (or generated) once at startup.

use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};

pub const KEY_LEN: usize = 32;

/// `reqwest` is built with `rustls-no-provider`, so a crypto provider must be
/// installed explicitly before any TLS client can be constructed.
pub fn ensure_rustls_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length or cannot be decoded.
    InvalidKey,
    /// Ciphertext is truncated, tampered with, or sealed under another key.
    Tampered,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey => f.write_str("invalid token key"),
            Self::Tampered => f.write_str("token ciphertext rejected"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Process-wide AEAD codec for token blobs.
pub struct TokenCodec {
    key: LessSafeKey,
}

impl TokenCodec {
    pub fn new(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, key_bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key: LessSafeKey::new(unbound) })
    }

    /// Seal a token. Layout: `nonce (12 bytes) || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut sealed = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| CryptoError::Tampered)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<String, CryptoError> {
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::Tampered);
        }
        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Tampered)?;

        let mut buf = sealed.to_vec();
        let opened = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| CryptoError::Tampered)?;
        String::from_utf8(opened.to_vec()).map_err(|_| CryptoError::Tampered)
    }
}

/// Resolve the codec key: explicit base64 value, else a key file under the
/// state dir (generated on first run).
pub fn load_or_create_key(
    explicit: Option<&str>,
    key_path: &Path,
) -> anyhow::Result<[u8; KEY_LEN]> {
    if let Some(encoded) = explicit {
        let decoded = STANDARD.decode(encoded.trim())?;
        return decoded
            .try_into()
            .map_err(|_| anyhow::anyhow!("token key must be {KEY_LEN} bytes (base64-encoded)"));
    }

    if key_path.exists() {
        let contents = std::fs::read_to_string(key_path)?;
        let decoded = STANDARD.decode(contents.trim())?;
        return decoded
            .try_into()
            .map_err(|_| anyhow::anyhow!("key file {} is corrupt", key_path.display()));
    }

    let mut key = [0u8; KEY_LEN];
    rand::rng().fill(&mut key);
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(key_path, STANDARD.encode(key))?;
    tracing::info!(path = %key_path.display(), "generated new token key");
    Ok(key)
}
