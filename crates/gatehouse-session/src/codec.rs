//! Authenticated encryption of the session payload.
//!
//! Wire format: `b64url(header JSON) . b64url(nonce || ciphertext || tag)`.
//!
//! The header (`iat`/`uat`/`exp`) travels in the clear but is bound into the
//! AES-256-GCM associated data, so any tampering with it makes decryption
//! fail. Decryption tries every key in the ring's verify set, which is what
//! makes secret rotation transparent to live sessions.
//!
//! Decryption failures are not errors: a value that does not decrypt under
//! any key is simply not a session.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::SessionResult;
use crate::error::SessionError;
use crate::keyring::KeyRing;

/// AES-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;

/// Integrity-protected session metadata.
///
/// All fields are unix seconds. The invariant `exp > now` is enforced at
/// load time by the stores, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// When the session was created.
    pub iat: i64,
    /// When the session was last active.
    pub uat: i64,
    /// Absolute expiry.
    pub exp: i64,
}

/// Encrypts and decrypts session payloads under a [`KeyRing`].
#[derive(Clone)]
pub struct SessionCodec {
    keyring: Arc<KeyRing>,
}

impl SessionCodec {
    /// Creates a codec over the given key ring.
    #[must_use]
    pub fn new(keyring: Arc<KeyRing>) -> Self {
        Self { keyring }
    }

    /// Encrypts a payload under the current encryption key.
    ///
    /// # Errors
    ///
    /// Returns a crypto or serialization error; both are server-side faults
    /// on the write path and must surface to the caller.
    pub fn encrypt(
        &self,
        header: &SessionHeader,
        values: &Map<String, Value>,
    ) -> SessionResult<String> {
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
        let plaintext = serde_json::to_vec(values)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new(self.keyring.current().encryption().into());
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: header_b64.as_bytes(),
                },
            )
            .map_err(|_| SessionError::crypto("session payload encryption failed"))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{header_b64}.{}", URL_SAFE_NO_PAD.encode(combined)))
    }

    /// Decrypts a value, trying every key in the verify set.
    ///
    /// Returns `None` on any cryptographic or parse failure. Never errors:
    /// an unreadable session is an anonymous session.
    #[must_use]
    pub fn decrypt(&self, value: &str) -> Option<(SessionHeader, Map<String, Value>)> {
        let (header_b64, body_b64) = value.split_once('.')?;
        let header_bytes = URL_SAFE_NO_PAD.decode(header_b64).ok()?;
        let header: SessionHeader = serde_json::from_slice(&header_bytes).ok()?;

        let combined = URL_SAFE_NO_PAD.decode(body_b64).ok()?;
        if combined.len() < NONCE_SIZE {
            return None;
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        for key in self.keyring.verify_set() {
            let cipher = Aes256Gcm::new(key.encryption().into());
            if let Ok(plaintext) = cipher.decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: header_b64.as_bytes(),
                },
            ) {
                match serde_json::from_slice(&plaintext) {
                    Ok(values) => return Some((header, values)),
                    Err(err) => {
                        debug!(error = %err, "decrypted session payload is not valid JSON");
                        return None;
                    }
                }
            }
        }
        debug!("session payload did not decrypt under any known key");
        None
    }
}
