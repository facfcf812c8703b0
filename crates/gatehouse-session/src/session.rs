//! The request-scoped session value.
//!
//! A [`Session`] is a mapping of application-defined keys to JSON values.
//! When the user is authenticated it carries at least `id_token`, plus the
//! optional token-set fields. The parsed ID-token claims are memoized on the
//! session itself, keyed by the token string, so the cache can never leak
//! across requests or survive a token refresh.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

/// Session payload key holding the raw ID token.
pub const ID_TOKEN_KEY: &str = "id_token";

/// Decodes the payload segment of a JWT without verifying its signature.
///
/// Signature verification belongs to the OIDC protocol client; by the time a
/// token is in the session it has already been validated. Returns `None` for
/// anything that is not three dot-separated base64url segments of JSON.
#[must_use]
pub fn decode_claims(token: &str) -> Option<Value> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let _signature = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Mutable, request-owned session state.
///
/// Cloning a session clones the memoized claims as well; the memo is keyed
/// by the token string, so a clone can never serve stale claims.
#[derive(Debug, Clone, Default)]
pub struct Session {
    values: Map<String, Value>,
    // (id_token the claims were parsed from, parsed claims)
    claims: Option<(String, Value)>,
}

impl Session {
    /// Creates an empty (anonymous) session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing payload map.
    #[must_use]
    pub fn from_values(values: Map<String, Value>) -> Self {
        Self {
            values,
            claims: None,
        }
    }

    /// Borrows the underlying payload map.
    #[must_use]
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Consumes the session, returning the payload map.
    #[must_use]
    pub fn into_values(self) -> Map<String, Value> {
        self.values
    }

    /// Looks up a payload value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Looks up a payload value as a string slice.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Inserts a payload value, returning the previous one if present.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    /// Removes a payload value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Returns `true` if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The raw ID token, present when authenticated.
    #[must_use]
    pub fn id_token(&self) -> Option<&str> {
        self.get_str(ID_TOKEN_KEY)
    }

    /// Returns `true` if the session carries an ID token.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.id_token().is_some()
    }

    /// The parsed (unverified) ID-token claims, memoized per token.
    pub fn claims(&mut self) -> Option<&Value> {
        let token = self.id_token()?.to_string();
        let stale = match &self.claims {
            Some((cached_for, _)) => *cached_for != token,
            None => true,
        };
        if stale {
            let parsed = decode_claims(&token)?;
            self.claims = Some((token, parsed));
        }
        self.claims.as_ref().map(|(_, claims)| claims)
    }

    /// The `sub` claim of the ID token.
    pub fn subject(&mut self) -> Option<String> {
        self.claims()?.get("sub")?.as_str().map(str::to_string)
    }

    /// The `sid` claim of the ID token, when the provider issues one.
    pub fn session_id_claim(&mut self) -> Option<String> {
        self.claims()?.get("sid")?.as_str().map(str::to_string)
    }

    /// The `iat` claim of the ID token, as unix seconds.
    pub fn id_token_issued_at(&mut self) -> Option<i64> {
        self.claims()?.get("iat")?.as_i64()
    }
}
