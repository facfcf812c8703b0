//! Signed, single-read protocol-state cookies.
//!
//! During a login attempt the nonce, state, and PKCE verifier have to survive
//! the round trip to the identity provider without being stored in a session.
//! They travel in a short-lived cookie signed as `value.signature`, where the
//! signature is a base64url HMAC-SHA256 over the value under the ring's
//! current signing key. Verification accepts any key in the verify set.
//!
//! Reading is destructive: `get_once` deletes the cookie (and its legacy
//! fallback) whether or not verification succeeds, so a record can back at
//! most one callback.

use std::sync::Arc;

use axum_extra::extract::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cookie::{Cookie, SameSite};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::keyring::{KeyMaterial, KeyRing};

type HmacSha256 = Hmac<Sha256>;

/// Generates a cryptographically random, URL-safe nonce (32 bytes, base64url).
#[must_use]
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Signs `value` as `value.signature` under the given key.
pub(crate) fn sign_value(key: &KeyMaterial, value: &str) -> String {
    // HMAC accepts keys of any length, so construction cannot fail here.
    let mut mac = HmacSha256::new_from_slice(key.signing()).expect("HMAC accepts any key length");
    mac.update(value.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{value}.{signature}")
}

/// Verifies a `value.signature` string against every key in the ring.
///
/// Returns the bare value on success, `None` otherwise.
pub(crate) fn verify_value(keyring: &KeyRing, signed: &str) -> Option<String> {
    let (value, signature_b64) = signed.rsplit_once('.')?;
    let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;
    for key in keyring.verify_set() {
        let mut mac =
            HmacSha256::new_from_slice(key.signing()).expect("HMAC accepts any key length");
        mac.update(value.as_bytes());
        if mac.verify_slice(&signature).is_ok() {
            return Some(value.to_string());
        }
    }
    None
}

/// Cookie attributes for a transient record.
#[derive(Debug, Clone)]
pub struct TransientOptions {
    /// `SameSite` attribute. Defaults to `None`: the callback is a
    /// cross-site navigation from the identity provider.
    pub same_site: SameSite,
    /// `Secure` attribute.
    pub secure: bool,
    /// Cookie `Path`.
    pub path: String,
    /// Cookie `Domain`.
    pub domain: Option<String>,
    /// `Max-Age`; transient records should be short-lived.
    pub max_age: Option<time::Duration>,
    /// Issue the `_`-prefixed fallback cookie when `SameSite=None`, for
    /// legacy clients that drop cookies with unrecognized `SameSite` values.
    pub legacy_fallback: bool,
}

impl Default for TransientOptions {
    fn default() -> Self {
        Self {
            same_site: SameSite::None,
            secure: false,
            path: "/".to_string(),
            domain: None,
            max_age: Some(time::Duration::hours(1)),
            legacy_fallback: true,
        }
    }
}

/// Signs and verifies transient protocol-state cookies.
#[derive(Clone)]
pub struct TransientCodec {
    keyring: Arc<KeyRing>,
}

impl TransientCodec {
    /// Creates a codec over the given key ring.
    #[must_use]
    pub fn new(keyring: Arc<KeyRing>) -> Self {
        Self { keyring }
    }

    fn build_cookie(
        name: String,
        signed: String,
        opts: &TransientOptions,
        with_same_site: bool,
    ) -> Cookie<'static> {
        let mut builder = Cookie::build((name, signed))
            .http_only(true)
            .path(opts.path.clone());
        if with_same_site {
            builder = builder.same_site(opts.same_site).secure(opts.secure);
        }
        if let Some(domain) = &opts.domain {
            builder = builder.domain(domain.clone());
        }
        if let Some(max_age) = opts.max_age {
            builder = builder.max_age(max_age);
        }
        builder.build()
    }

    fn removal_cookie(name: String, opts: &TransientOptions) -> Cookie<'static> {
        let mut builder = Cookie::build((name, "")).path(opts.path.clone());
        if let Some(domain) = &opts.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Signs and stores a value; generates a nonce when `value` is `None`.
    ///
    /// Returns the updated jar and the raw value stored, so the caller can
    /// embed the same value in a redirect parameter.
    #[must_use]
    pub fn store(
        &self,
        jar: CookieJar,
        name: &str,
        value: Option<String>,
        opts: &TransientOptions,
    ) -> (CookieJar, String) {
        let value = value.unwrap_or_else(generate_nonce);
        let signed = sign_value(self.keyring.current(), &value);

        let mut jar = jar.add(Self::build_cookie(
            name.to_string(),
            signed.clone(),
            opts,
            true,
        ));
        if opts.same_site == SameSite::None && opts.legacy_fallback {
            jar = jar.add(Self::build_cookie(format!("_{name}"), signed, opts, false));
        }
        (jar, value)
    }

    /// Reads, verifies, and deletes a transient record.
    ///
    /// Falls back to the legacy `_`-prefixed cookie when the primary is
    /// absent. Both cookies are cleared regardless of the outcome.
    /// Verification failure or absence yields `None`; this never errors.
    #[must_use]
    pub fn get_once(
        &self,
        jar: CookieJar,
        name: &str,
        opts: &TransientOptions,
    ) -> (CookieJar, Option<String>) {
        let fallback = format!("_{name}");
        let signed = jar
            .get(name)
            .or_else(|| jar.get(&fallback))
            .map(|c| c.value().to_string());

        let jar = jar
            .remove(Self::removal_cookie(name.to_string(), opts))
            .remove(Self::removal_cookie(fallback, opts));

        let value = match signed {
            Some(signed) => {
                let verified = verify_value(&self.keyring, &signed);
                if verified.is_none() {
                    debug!(cookie = name, "transient cookie failed signature verification");
                }
                verified
            }
            None => None,
        };
        (jar, value)
    }
}
