//! Cookie-backed session persistence with chunking.
//!
//! The encrypted session travels entirely in cookies. Browsers cap a single
//! cookie at 4096 bytes, so values exceeding the per-cookie budget are split
//! into ordered chunks named `<base>.0`, `<base>.1`, … and reassembled on
//! read. Transitions between the chunked and unchunked shapes clear whatever
//! stale cookies the previous shape left behind.

use std::sync::Arc;

use axum_extra::extract::CookieJar;
use cookie::{Cookie, Expiration};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;

use super::super::codec::{SessionCodec, SessionHeader};
use crate::SessionResult;
use crate::config::SessionConfig;
use crate::keyring::KeyRing;

/// Industry-convention maximum size of a single cookie, in bytes.
pub const MAX_COOKIE_SIZE: usize = 4096;

/// Reserved headroom per cookie for the name, attributes, and separators.
const COOKIE_OVERHEAD: usize = 160;

/// Splits an encrypted value into per-cookie chunks of at most `budget` bytes.
///
/// The value is base64 text, so byte-boundary splits are always valid UTF-8.
#[must_use]
pub fn split_into_chunks(value: &str, budget: usize) -> Vec<String> {
    value
        .as_bytes()
        .chunks(budget.max(1))
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// Reassembles a value from `<base>` or its `<base>.<n>` chunk cookies.
///
/// A single unsuffixed cookie wins when present. Chunks are sorted
/// numerically by suffix and concatenated.
#[must_use]
pub fn assemble_chunks(jar: &CookieJar, base: &str) -> Option<String> {
    if let Some(cookie) = jar.get(base) {
        return Some(cookie.value().to_string());
    }
    let mut chunks: Vec<(u32, &str)> = jar
        .iter()
        .filter_map(|cookie| {
            let index = parse_chunk_index(cookie.name(), base)?;
            Some((index, cookie.value()))
        })
        .collect();
    if chunks.is_empty() {
        return None;
    }
    chunks.sort_by_key(|(index, _)| *index);
    Some(chunks.iter().map(|(_, value)| *value).collect())
}

/// Parses `<base>.<n>` cookie names; `None` for anything else.
fn parse_chunk_index(name: &str, base: &str) -> Option<u32> {
    name.strip_prefix(base)?.strip_prefix('.')?.parse().ok()
}

/// The stateless, cookie-only session backend.
#[derive(Clone)]
pub struct CookieSessionStore {
    codec: SessionCodec,
    config: SessionConfig,
}

impl CookieSessionStore {
    /// Creates a cookie store over the given key ring and configuration.
    #[must_use]
    pub fn new(keyring: Arc<KeyRing>, config: SessionConfig) -> Self {
        Self {
            codec: SessionCodec::new(keyring),
            config,
        }
    }

    fn chunk_budget(&self) -> usize {
        MAX_COOKIE_SIZE.saturating_sub(self.config.name.len() + COOKIE_OVERHEAD)
    }

    fn session_cookie(&self, name: String, value: String, exp: i64) -> Cookie<'static> {
        let cookie_config = &self.config.cookie;
        let mut builder = Cookie::build((name, value))
            .http_only(true)
            .secure(cookie_config.secure)
            .same_site(cookie_config.same_site.to_same_site())
            .path(cookie_config.path.clone());
        if let Some(domain) = &cookie_config.domain {
            builder = builder.domain(domain.clone());
        }
        if !self.config.transient
            && let Ok(expires) = OffsetDateTime::from_unix_timestamp(exp)
        {
            builder = builder.expires(Expiration::DateTime(expires));
        }
        builder.build()
    }

    fn removal_cookie(&self, name: String) -> Cookie<'static> {
        let mut builder = Cookie::build((name, "")).path(self.config.cookie.path.clone());
        if let Some(domain) = &self.config.cookie.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Names of all chunk cookies currently in the jar.
    fn chunk_names(&self, jar: &CookieJar) -> Vec<String> {
        jar.iter()
            .filter(|c| parse_chunk_index(c.name(), &self.config.name).is_some())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Loads and decrypts the session from the jar.
    ///
    /// Returns `None` for absent, undecryptable, or expired sessions; the
    /// caller falls open to an anonymous session.
    #[must_use]
    pub fn read(&self, jar: &CookieJar) -> Option<(SessionHeader, Map<String, Value>)> {
        let value = assemble_chunks(jar, &self.config.name)?;
        let (header, values) = self.codec.decrypt(&value)?;
        if self.config.is_expired(&header, OffsetDateTime::now_utc()) {
            debug!("session cookie is expired, discarding");
            return None;
        }
        Some((header, values))
    }

    /// Encrypts and writes the session, chunking as needed.
    ///
    /// Clears stale chunk cookies when the value newly fits in one cookie,
    /// and the stale base cookie when the value newly requires chunking.
    ///
    /// # Errors
    ///
    /// Returns a crypto or serialization error from the encrypt step.
    pub fn write(
        &self,
        jar: CookieJar,
        header: &SessionHeader,
        values: &Map<String, Value>,
    ) -> SessionResult<CookieJar> {
        let encrypted = self.codec.encrypt(header, values)?;
        let budget = self.chunk_budget();
        let existing_chunks = self.chunk_names(&jar);

        if encrypted.len() <= budget {
            let mut jar = jar.add(self.session_cookie(
                self.config.name.clone(),
                encrypted,
                header.exp,
            ));
            for name in existing_chunks {
                jar = jar.remove(self.removal_cookie(name));
            }
            return Ok(jar);
        }

        let chunks = split_into_chunks(&encrypted, budget);
        let mut jar = jar.remove(self.removal_cookie(self.config.name.clone()));
        for name in existing_chunks {
            let stale = parse_chunk_index(&name, &self.config.name)
                .is_some_and(|index| index as usize >= chunks.len());
            if stale {
                jar = jar.remove(self.removal_cookie(name));
            }
        }
        for (index, chunk) in chunks.into_iter().enumerate() {
            jar = jar.add(self.session_cookie(
                format!("{}.{index}", self.config.name),
                chunk,
                header.exp,
            ));
        }
        Ok(jar)
    }

    /// Clears the base cookie and every chunk cookie.
    #[must_use]
    pub fn clear(&self, jar: CookieJar) -> CookieJar {
        let mut jar = jar.remove(self.removal_cookie(self.config.name.clone()));
        for name in self.chunk_names(&jar) {
            jar = jar.remove(self.removal_cookie(name));
        }
        jar
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> CookieSessionStore {
        CookieSessionStore::new(
            Arc::new(KeyRing::from_secret("test secret").unwrap()),
            SessionConfig::default(),
        )
    }

    fn header_now() -> SessionHeader {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        SessionHeader {
            iat: now,
            uat: now,
            exp: now + 3600,
        }
    }

    fn payload(size: usize) -> Map<String, Value> {
        let mut values = Map::new();
        values.insert("blob".to_string(), json!("x".repeat(size)));
        values
    }

    #[test]
    fn test_split_and_reassemble_identity() {
        for size in [1, 10, 100, 4000, 4096, 9000, 20_000] {
            let value: String = "abcdefgh".chars().cycle().take(size).collect();
            let chunks = split_into_chunks(&value, 1000);
            assert_eq!(chunks.len(), size.div_ceil(1000));
            assert_eq!(chunks.concat(), value);
        }
    }

    #[test]
    fn test_small_session_uses_single_cookie() {
        let store = store();
        let jar = store
            .write(CookieJar::new(), &header_now(), &payload(10))
            .unwrap();
        assert!(jar.get("appSession").is_some());
        assert!(jar.get("appSession.0").is_none());

        let (_, values) = store.read(&jar).unwrap();
        assert_eq!(values, payload(10));
    }

    #[test]
    fn test_large_session_chunks_and_reassembles() {
        let store = store();
        let jar = store
            .write(CookieJar::new(), &header_now(), &payload(10_000))
            .unwrap();
        assert!(jar.get("appSession").is_none());
        assert!(jar.get("appSession.0").is_some());
        assert!(jar.get("appSession.1").is_some());

        // Every chunk respects the cookie budget.
        for cookie in jar.iter() {
            assert!(cookie.value().len() <= MAX_COOKIE_SIZE);
        }

        let (_, values) = store.read(&jar).unwrap();
        assert_eq!(values, payload(10_000));
    }

    #[test]
    fn test_shrinking_session_clears_stale_chunks() {
        let store = store();
        let jar = store
            .write(CookieJar::new(), &header_now(), &payload(10_000))
            .unwrap();
        assert!(jar.get("appSession.0").is_some());

        let jar = store.write(jar, &header_now(), &payload(10)).unwrap();
        assert!(jar.get("appSession").is_some());
        assert!(jar.get("appSession.0").is_none());
        assert!(jar.get("appSession.1").is_none());

        let (_, values) = store.read(&jar).unwrap();
        assert_eq!(values, payload(10));
    }

    #[test]
    fn test_growing_session_clears_stale_base_cookie() {
        let store = store();
        let jar = store
            .write(CookieJar::new(), &header_now(), &payload(10))
            .unwrap();
        let jar = store.write(jar, &header_now(), &payload(10_000)).unwrap();
        assert!(jar.get("appSession").is_none());

        let (_, values) = store.read(&jar).unwrap();
        assert_eq!(values, payload(10_000));
    }

    #[test]
    fn test_clear_removes_all_shapes() {
        let store = store();
        let jar = store
            .write(CookieJar::new(), &header_now(), &payload(10_000))
            .unwrap();
        let jar = store.clear(jar);
        assert!(store.read(&jar).is_none());
        assert_eq!(jar.iter().count(), 0);
    }

    #[test]
    fn test_expired_session_never_returned() {
        let store = store();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = SessionHeader {
            iat: now - 10,
            uat: now - 10,
            exp: now - 1,
        };
        let jar = store.write(CookieJar::new(), &header, &payload(10)).unwrap();
        assert!(store.read(&jar).is_none());
    }

    #[test]
    fn test_garbage_cookie_reads_as_no_session() {
        let store = store();
        let jar = CookieJar::new().add(Cookie::new("appSession", "garbage"));
        assert!(store.read(&jar).is_none());
    }
}
