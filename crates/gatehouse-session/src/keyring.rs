//! Key derivation and rotation.
//!
//! A [`KeyRing`] turns one or more operator-supplied secrets into fixed-length
//! encryption and signing keys via HKDF-SHA256. The first secret is the
//! "current" one: new session payloads are encrypted and new cookies signed
//! with its keys. Every listed secret remains valid for decryption and
//! signature verification, so rotating secrets never invalidates sessions
//! written under a still-listed old secret.
//!
//! The ring is immutable after construction and is shared across requests
//! behind an `Arc`.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::SessionResult;
use crate::error::SessionError;

/// HKDF context label for the AES-256-GCM session encryption key.
const ENCRYPTION_INFO: &[u8] = b"gatehouse session encryption";

/// HKDF context label for the HMAC-SHA256 cookie signing key.
const SIGNING_INFO: &[u8] = b"gatehouse cookie signing";

/// Derived key pair for a single operator secret.
///
/// The two keys are expanded from the same secret under distinct context
/// labels, so the encryption key and signing key never collide even though
/// they share an input.
#[derive(Clone)]
pub struct KeyMaterial {
    encryption: [u8; 32],
    signing: [u8; 32],
}

impl KeyMaterial {
    fn derive(secret: &str) -> SessionResult<Self> {
        let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut encryption = [0u8; 32];
        let mut signing = [0u8; 32];
        hk.expand(ENCRYPTION_INFO, &mut encryption)
            .map_err(|e| SessionError::crypto(format!("HKDF expand failed: {e}")))?;
        hk.expand(SIGNING_INFO, &mut signing)
            .map_err(|e| SessionError::crypto(format!("HKDF expand failed: {e}")))?;
        Ok(Self {
            encryption,
            signing,
        })
    }

    /// The AES-256-GCM session encryption key.
    #[must_use]
    pub fn encryption(&self) -> &[u8; 32] {
        &self.encryption
    }

    /// The HMAC-SHA256 cookie signing key.
    #[must_use]
    pub fn signing(&self) -> &[u8; 32] {
        &self.signing
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes must never reach logs.
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Ordered set of derived key pairs.
///
/// Index 0 is the current key pair; all entries are valid for verification
/// and decryption.
#[derive(Clone, Debug)]
pub struct KeyRing {
    keys: Vec<KeyMaterial>,
}

impl KeyRing {
    /// Derives a key ring from an ordered list of secrets, newest first.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no secret is supplied. This is a
    /// setup-time failure; it never occurs per-request.
    pub fn from_secrets<S: AsRef<str>>(secrets: &[S]) -> SessionResult<Self> {
        if secrets.is_empty() {
            return Err(SessionError::configuration(
                "at least one session secret is required",
            ));
        }
        let keys = secrets
            .iter()
            .map(|s| KeyMaterial::derive(s.as_ref()))
            .collect::<SessionResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    /// Derives a single-secret key ring.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the secret is empty.
    pub fn from_secret(secret: &str) -> SessionResult<Self> {
        if secret.is_empty() {
            return Err(SessionError::configuration(
                "the session secret must not be empty",
            ));
        }
        Self::from_secrets(&[secret])
    }

    /// The current key pair, used for all new encryption and signing.
    #[must_use]
    pub fn current(&self) -> &KeyMaterial {
        // Construction guarantees at least one entry.
        &self.keys[0]
    }

    /// All key pairs, newest first, valid for verification and decryption.
    #[must_use]
    pub fn verify_set(&self) -> &[KeyMaterial] {
        &self.keys
    }

    /// Number of secrets in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always `false`: construction rejects empty rings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
