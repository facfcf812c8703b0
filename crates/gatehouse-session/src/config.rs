//! Session configuration.
//!
//! Configuration is plain `serde` data with defaults, validated once at setup
//! time by [`SessionConfig::validate`]. Invalid configuration is fatal before
//! the first request is served; nothing in here fails per-request.
//!
//! # Example (TOML)
//!
//! ```toml
//! [session]
//! name = "appSession"
//! rolling = true
//! rolling_duration = "1day"
//! absolute_duration = "7days"
//!
//! [session.cookie]
//! path = "/"
//! secure = true
//! same_site = "lax"
//! ```

use std::time::Duration;

use cookie::SameSite;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::SessionHeader;

/// Default session cookie name.
pub const DEFAULT_SESSION_COOKIE: &str = "appSession";

/// Errors raised by configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The session cookie name is empty or contains invalid characters.
    #[error("Invalid session cookie name: {0}")]
    InvalidCookieName(String),

    /// A configured duration is zero.
    #[error("Invalid duration: {0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Rolling and absolute expiry are both disabled.
    #[error("At least one of rolling_duration or absolute_duration must be configured")]
    NoExpiry,
}

/// `SameSite` cookie policy, as configuration data.
///
/// The `cookie` crate's `SameSite` does not implement `serde` traits, so the
/// policy is mirrored here and converted at the point of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    /// `SameSite=Strict`.
    Strict,
    /// `SameSite=Lax` (default for the session cookie).
    #[default]
    Lax,
    /// `SameSite=None`. Requires `Secure` on modern clients.
    None,
}

impl SameSitePolicy {
    /// Converts to the `cookie` crate representation.
    #[must_use]
    pub fn to_same_site(self) -> SameSite {
        match self {
            Self::Strict => SameSite::Strict,
            Self::Lax => SameSite::Lax,
            Self::None => SameSite::None,
        }
    }
}

/// Attributes applied to the session cookie (and, with adjusted defaults,
/// to transient protocol cookies).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Cookie `Domain` attribute.
    pub domain: Option<String>,

    /// Cookie `Path` attribute.
    pub path: String,

    /// Cookie `Secure` attribute. Should be `true` whenever the application
    /// is served over HTTPS.
    pub secure: bool,

    /// Cookie `SameSite` attribute.
    pub same_site: SameSitePolicy,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            domain: None,
            path: "/".to_string(),
            secure: false,
            same_site: SameSitePolicy::Lax,
        }
    }
}

/// Session engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base name of the session cookie. Chunked payloads append `.0`, `.1`, …
    pub name: String,

    /// Whether activity extends the session lifetime.
    pub rolling: bool,

    /// Idle timeout: the session expires this long after the last request
    /// that touched it. Ignored when `rolling` is `false`.
    #[serde(with = "humantime_serde::option")]
    pub rolling_duration: Option<Duration>,

    /// Hard cap: the session expires this long after it was created,
    /// regardless of activity. `None` disables the cap.
    #[serde(with = "humantime_serde::option")]
    pub absolute_duration: Option<Duration>,

    /// Attributes of the session cookie.
    pub cookie: CookieConfig,

    /// Issue a session cookie without `Expires`/`Max-Age`, scoping it to the
    /// browser session.
    pub transient: bool,

    /// HMAC-sign the store-reference cookie. Only meaningful for the
    /// external-store backend with a custom id generator, where a predictable
    /// id must not be trusted as entropy.
    pub sign_store_cookie: bool,

    /// When a transient cookie is issued with `SameSite=None`, also issue a
    /// fallback copy without the attribute for legacy clients that drop
    /// cookies with unrecognized `SameSite` values.
    pub legacy_same_site_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SESSION_COOKIE.to_string(),
            rolling: true,
            rolling_duration: Some(Duration::from_secs(24 * 60 * 60)),
            absolute_duration: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            cookie: CookieConfig::default(),
            transient: false,
            sign_store_cookie: false,
            legacy_same_site_cookie: true,
        }
    }
}

impl SessionConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the cookie name is unusable, a duration
    /// is zero, or both expiry mechanisms are disabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidCookieName(self.name.clone()));
        }
        if self.rolling_duration.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroDuration("rolling_duration"));
        }
        if self.absolute_duration.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroDuration("absolute_duration"));
        }
        if self.effective_rolling().is_none() && self.absolute_duration.is_none() {
            return Err(ConfigError::NoExpiry);
        }
        Ok(())
    }

    /// The idle timeout, when rolling expiry is enabled.
    #[must_use]
    pub fn effective_rolling(&self) -> Option<Duration> {
        if self.rolling { self.rolling_duration } else { None }
    }

    /// Computes the absolute expiry written into the session header.
    ///
    /// `min(uat + rolling, iat + absolute)` when both are configured,
    /// otherwise whichever one is set. Rolling disabled means the idle
    /// timeout does not participate.
    #[must_use]
    pub fn expires_at(&self, iat: i64, uat: i64) -> i64 {
        let rolling = self
            .effective_rolling()
            .map(|d| uat.saturating_add(d.as_secs() as i64));
        let absolute = self
            .absolute_duration
            .map(|d| iat.saturating_add(d.as_secs() as i64));
        match (rolling, absolute) {
            (Some(r), Some(a)) => r.min(a),
            (Some(r), None) => r,
            (None, Some(a)) => a,
            // validate() rejects this combination.
            (None, None) => uat,
        }
    }

    /// Returns `true` if a loaded session header is expired at `now`.
    ///
    /// Rejects on the embedded `exp`, then re-checks the configured rolling
    /// and absolute windows so that tightening either duration takes effect
    /// on sessions written under a more permissive configuration.
    #[must_use]
    pub fn is_expired(&self, header: &SessionHeader, now: OffsetDateTime) -> bool {
        let now = now.unix_timestamp();
        if header.exp <= now {
            return true;
        }
        if let Some(rolling) = self.effective_rolling()
            && header.uat.saturating_add(rolling.as_secs() as i64) <= now
        {
            return true;
        }
        if let Some(absolute) = self.absolute_duration
            && header.iat.saturating_add(absolute.as_secs() as i64) <= now
        {
            return true;
        }
        false
    }
}
