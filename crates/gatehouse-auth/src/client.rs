//! The OIDC protocol-client seam.
//!
//! Everything that talks to the identity provider's wire endpoints sits
//! behind [`OidcClient`]: code/token exchange with full JWT validation,
//! refresh grants, and pushed authorization requests. The engine composes
//! redirects and sessions around it; tests substitute a stub.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::error::AuthResult;
use crate::tokens::TokenSet;

/// Parameters the provider sends to the callback endpoint, by query string
/// or `form_post` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code, for code-bearing response types.
    pub code: Option<String>,
    /// The `state` parameter echoed back by the provider.
    pub state: Option<String>,
    /// ID token, for hybrid and implicit response types.
    pub id_token: Option<String>,
    /// OAuth error code when the provider rejected the request.
    pub error: Option<String>,
    /// Human-readable companion to `error`.
    pub error_description: Option<String>,
}

/// Expected values the client must enforce while validating a callback.
#[derive(Debug, Clone, Default)]
pub struct CallbackChecks {
    /// Nonce the ID token's `nonce` claim must equal.
    pub nonce: Option<String>,
    /// State the echoed `state` parameter must equal.
    pub state: Option<String>,
    /// PKCE verifier for the code exchange.
    pub code_verifier: Option<String>,
    /// Maximum acceptable authentication age, in seconds.
    pub max_age: Option<u64>,
}

/// Optional overrides for a refresh grant.
#[derive(Debug, Clone, Default)]
pub struct RefreshRequest {
    /// Audience to request the new access token for.
    pub audience: Option<String>,
    /// Space-separated scope to request.
    pub scope: Option<String>,
    /// Organization to bind the new token to.
    pub organization: Option<String>,
}

/// Wire-level OIDC operations against a single identity provider.
#[async_trait]
pub trait OidcClient: Send + Sync {
    /// The provider's issuer identifier.
    fn issuer(&self) -> &str;

    /// The authorization endpoint, without query parameters.
    fn authorization_endpoint(&self) -> Url;

    /// The RP-initiated-logout endpoint, when the provider publishes one.
    fn end_session_endpoint(&self) -> Option<Url>;

    /// Pushes the authorization parameters to the provider (RFC 9126) and
    /// returns the `request_uri` to redirect with.
    ///
    /// The default implementation reports PAR as unsupported; the engine
    /// then falls back to plain redirect parameters.
    ///
    /// # Errors
    ///
    /// Returns an upstream error when the push fails.
    async fn pushed_authorization_request(
        &self,
        params: &[(String, String)],
    ) -> AuthResult<Option<String>> {
        let _ = params;
        Ok(None)
    }

    /// Validates the callback and exchanges the code for tokens.
    ///
    /// Implementations must verify the ID-token signature, issuer,
    /// audience, expiry, and the nonce/state/PKCE values in `checks`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when validation fails or the provider
    /// rejected the request, and an upstream error when it cannot be
    /// reached.
    async fn callback(
        &self,
        params: CallbackParams,
        checks: CallbackChecks,
    ) -> AuthResult<TokenSet>;

    /// Performs a `refresh_token` grant.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the provider rejects the grant and an
    /// upstream error when it cannot be reached.
    async fn refresh(&self, refresh_token: &str, request: RefreshRequest)
        -> AuthResult<TokenSet>;
}

/// A single-slot cache for provider discovery documents.
///
/// Discovery rarely changes; cache it with a TTL and let operators evict it
/// explicitly after a known provider migration.
#[derive(Debug)]
pub struct DiscoveryCache<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> DiscoveryCache<T> {
    /// Creates an empty cache with the given time-to-live.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// The cached value, if present and fresh.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        let guard = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    /// Stores a freshly fetched value.
    pub fn put(&self, value: T) {
        let mut guard = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some((Instant::now(), value));
    }

    /// Drops the cached value so the next read refetches.
    pub fn evict(&self) {
        let mut guard = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_serves_until_evicted() {
        let cache = DiscoveryCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(), None::<String>);

        cache.put("doc-v1".to_string());
        assert_eq!(cache.get().as_deref(), Some("doc-v1"));

        cache.evict();
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn test_cache_expires_by_ttl() {
        let cache = DiscoveryCache::new(Duration::ZERO);
        cache.put("doc-v1".to_string());
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn test_cache_replacement_wins() {
        let cache = DiscoveryCache::new(Duration::from_secs(60));
        cache.put("doc-v1".to_string());
        cache.put("doc-v2".to_string());
        assert_eq!(cache.get().as_deref(), Some("doc-v2"));
    }
}
