//! Token-set storage, compatibility matching, and refresh.
//!
//! The token set from the most recent callback or refresh lives flattened
//! at the session root (`id_token`, `access_token`, ...). When history is
//! enabled, every set is also appended to the `token_history` array so a
//! request needing a different audience or scope can be served without a
//! fresh login.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use tracing::{debug, warn};

use gatehouse_session::Session;

use crate::client::{OidcClient, RefreshRequest};
use crate::error::AuthResult;

/// Scope requested when the operator does not configure one.
pub const DEFAULT_SCOPE: &str = "openid profile email";

/// Session payload key holding the token history array.
pub const TOKEN_HISTORY_KEY: &str = "token_history";

/// How long an expired, refreshable history entry is kept before pruning.
const REFRESH_GRACE_SECS: i64 = 24 * 60 * 60;

const ROOT_KEYS: [&str; 8] = [
    "id_token",
    "access_token",
    "refresh_token",
    "token_type",
    "expires_at",
    "scope",
    "audience",
    "organization",
];

/// A validated set of tokens from one callback or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// The validated ID token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Access token for the requested audience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Refresh token, when the provider granted one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token type, normally `Bearer`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Access-token expiry as unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Space-separated scope the token was granted with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Audience the access token was issued for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Organization the token is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl TokenSet {
    /// Returns `true` when the access token cannot be used without a
    /// refresh.
    ///
    /// A set without an expiry counts as already expired here; only a
    /// fresh provider answer can vouch for it.
    #[must_use]
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|exp| exp <= now)
    }

    /// Returns `true` when the access token is past a known expiry.
    ///
    /// A set without an expiry is never past one; pruning must not drop
    /// an entry on a missing timestamp.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Returns `true` when the set can be refreshed.
    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    fn scope_set<'a>(raw: Option<&'a str>, default_scope: &'a str) -> HashSet<&'a str> {
        raw.unwrap_or(default_scope).split_whitespace().collect()
    }

    /// Returns `true` when this set satisfies the query.
    ///
    /// Audience and organization must match exactly, with absence on both
    /// sides counting as a match. The requested scope must be a subset of
    /// the granted scope.
    #[must_use]
    pub fn matches(&self, query: &TokenQuery, default_scope: &str) -> bool {
        if self.audience != query.audience || self.organization != query.organization {
            return false;
        }
        let requested = Self::scope_set(query.scope.as_deref(), default_scope);
        let granted = Self::scope_set(self.scope.as_deref(), default_scope);
        requested.is_subset(&granted)
    }
}

/// What a caller needs a token for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenQuery {
    /// Required audience; `None` matches sets issued without one.
    pub audience: Option<String>,
    /// Required scope; defaults to the configured default scope.
    pub scope: Option<String>,
    /// Required organization; `None` matches sets issued without one.
    pub organization: Option<String>,
}

/// Token lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TokenLifecycleConfig {
    /// Keep a history of issued token sets on the session.
    pub history: bool,
    /// Maximum history entries; the oldest are dropped first.
    pub history_limit: usize,
    /// Refresh an expired current set automatically at request time.
    pub auto_refresh: bool,
    /// Use multi-resource refresh tokens to mint sets for new audiences.
    pub use_mrrt: bool,
    /// Scope to request and match against when none is given.
    pub default_scope: String,
}

impl Default for TokenLifecycleConfig {
    fn default() -> Self {
        Self {
            history: true,
            history_limit: 16,
            auto_refresh: false,
            use_mrrt: false,
            default_scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

/// Reads the current (most recent) token set off the session root.
#[must_use]
pub fn current_token_set(session: &Session) -> Option<TokenSet> {
    if !session.is_authenticated() {
        return None;
    }
    let mut subset = Map::new();
    for key in ROOT_KEYS {
        if let Some(value) = session.get(key) {
            subset.insert(key.to_string(), value.clone());
        }
    }
    serde_json::from_value(Value::Object(subset)).ok()
}

/// Writes a token set onto the session root, clearing absent fields.
pub fn apply_token_set(session: &mut Session, set: &TokenSet) {
    // to_value on a field-only struct cannot fail.
    let Ok(Value::Object(fields)) = serde_json::to_value(set) else {
        return;
    };
    for key in ROOT_KEYS {
        match fields.get(key) {
            Some(value) => session.insert(key, value.clone()),
            None => session.remove(key),
        };
    }
}

/// Reads the token history array off the session.
#[must_use]
pub fn token_history(session: &Session) -> Vec<TokenSet> {
    session
        .get(TOKEN_HISTORY_KEY)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

fn write_history(session: &mut Session, history: &[TokenSet]) {
    if history.is_empty() {
        session.remove(TOKEN_HISTORY_KEY);
    } else {
        session.insert(TOKEN_HISTORY_KEY, json!(history));
    }
}

/// Finds, refreshes, and prunes token sets on a session.
#[derive(Clone)]
pub struct TokenLifecycle {
    config: TokenLifecycleConfig,
    client: Arc<dyn OidcClient>,
}

impl TokenLifecycle {
    /// Creates a lifecycle manager over the given protocol client.
    #[must_use]
    pub fn new(config: TokenLifecycleConfig, client: Arc<dyn OidcClient>) -> Self {
        Self { config, client }
    }

    /// The lifecycle configuration.
    #[must_use]
    pub fn config(&self) -> &TokenLifecycleConfig {
        &self.config
    }

    /// Installs a token set as current and records it in the history.
    pub fn set_current(&self, session: &mut Session, set: TokenSet) {
        apply_token_set(session, &set);
        if self.config.history {
            let mut history = token_history(session);
            history.push(set);
            while history.len() > self.config.history_limit {
                history.remove(0);
            }
            write_history(session, &history);
        }
    }

    /// Finds a token set satisfying the query.
    ///
    /// Search order: a live match (current set first, then history); an
    /// expired match with a refresh token, refreshed in place; an expired
    /// match without one, returned as-is for the caller to judge; and
    /// finally, with MRRT enabled, a lateral refresh of any refreshable
    /// history entry requesting the queried audience and scope. Refresh
    /// failures along the way are logged and the search continues, so this
    /// never errors — an unusable provider simply yields no match.
    pub async fn find_compatible(
        &self,
        session: &mut Session,
        query: &TokenQuery,
    ) -> Option<TokenSet> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let default_scope = self.config.default_scope.clone();

        let current = current_token_set(session);
        let history = token_history(session);
        // Candidates in preference order: current first, then history
        // newest-first, skipping the history copy of the current set.
        let mut candidates: Vec<TokenSet> = Vec::with_capacity(history.len() + 1);
        candidates.extend(current.clone());
        candidates.extend(
            history
                .iter()
                .rev()
                .filter(|entry| current.as_ref() != Some(*entry))
                .cloned(),
        );
        candidates.retain(|set| set.matches(query, &default_scope));

        if let Some(live) = candidates.iter().find(|set| !set.needs_refresh(now)) {
            return Some(live.clone());
        }

        for expired in candidates.iter().filter(|set| set.has_refresh_token()) {
            let Some(refresh_token) = expired.refresh_token.clone() else {
                continue;
            };
            match self
                .client
                .refresh(&refresh_token, RefreshRequest::default())
                .await
            {
                Ok(mut refreshed) => {
                    if refreshed.refresh_token.is_none() {
                        refreshed.refresh_token = Some(refresh_token);
                    }
                    if current.as_ref() == Some(expired) {
                        self.set_current(session, refreshed.clone());
                    } else {
                        self.replace_history_entry(session, expired, &refreshed);
                    }
                    return Some(refreshed);
                }
                Err(err) => {
                    debug!(error = %err, "refresh of an expired matching token set failed");
                }
            }
        }

        // Last resort before minting: an expired match that cannot be
        // refreshed is still handed back.
        if let Some(expired) = candidates.iter().find(|set| !set.has_refresh_token()) {
            return Some(expired.clone());
        }

        if self.config.use_mrrt {
            return self.mrrt_refresh(session, query, &history).await;
        }
        None
    }

    fn replace_history_entry(&self, session: &mut Session, old: &TokenSet, new: &TokenSet) {
        let mut history = token_history(session);
        match history.iter().position(|entry| entry == old) {
            Some(index) => history[index] = new.clone(),
            None => {
                history.push(new.clone());
                while history.len() > self.config.history_limit {
                    history.remove(0);
                }
            }
        }
        write_history(session, &history);
    }

    /// Lateral refresh: ask the provider to mint a set for the queried
    /// audience from a refresh token held for the same organization.
    async fn mrrt_refresh(
        &self,
        session: &mut Session,
        query: &TokenQuery,
        history: &[TokenSet],
    ) -> Option<TokenSet> {
        let request = RefreshRequest {
            audience: query.audience.clone(),
            scope: Some(
                query
                    .scope
                    .clone()
                    .unwrap_or_else(|| self.config.default_scope.clone()),
            ),
            organization: query.organization.clone(),
        };
        for entry in history.iter().rev() {
            // A refresh token bound to another organization never goes
            // upstream for this query.
            if entry.organization != query.organization {
                continue;
            }
            let Some(refresh_token) = entry.refresh_token.as_deref() else {
                continue;
            };
            match self.client.refresh(refresh_token, request.clone()).await {
                Ok(minted) if minted.matches(query, &self.config.default_scope) => {
                    // The source entry keeps its refresh token; only the
                    // minted set joins the history.
                    let mut history = token_history(session);
                    history.push(minted.clone());
                    while history.len() > self.config.history_limit {
                        history.remove(0);
                    }
                    write_history(session, &history);
                    return Some(minted);
                }
                Ok(_) => {
                    debug!("lateral refresh returned a set not matching the query");
                }
                Err(err) => {
                    debug!(error = %err, "lateral refresh attempt failed");
                }
            }
        }
        None
    }

    /// Refreshes the current set when it is expired and refreshable.
    ///
    /// Returns `true` when a refresh happened. A no-op unless
    /// `auto_refresh` is enabled.
    ///
    /// # Errors
    ///
    /// Returns the protocol or upstream error when the refresh grant fails;
    /// the session is left unchanged in that case.
    pub async fn maybe_refresh_current(&self, session: &mut Session) -> AuthResult<bool> {
        if !self.config.auto_refresh {
            return Ok(false);
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let Some(current) = current_token_set(session) else {
            return Ok(false);
        };
        if !current.needs_refresh(now) {
            return Ok(false);
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Ok(false);
        };

        let mut refreshed = self
            .client
            .refresh(&refresh_token, RefreshRequest::default())
            .await?;
        // Providers that rotate refresh tokens omit the old one; keep it so
        // the session stays refreshable either way.
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        // Writing the new set invalidates the session's claims memo before
        // anything compares old and new identity.
        self.set_current(session, refreshed);
        Ok(true)
    }

    /// Drops history entries that can no longer serve a request.
    ///
    /// An expired entry without a refresh token is useless immediately; an
    /// expired refreshable entry is kept for a grace window in case a
    /// lateral refresh still wants its token.
    pub fn prune(&self, session: &mut Session, now: i64) {
        let history = token_history(session);
        if history.is_empty() {
            return;
        }
        let kept: Vec<TokenSet> = history
            .into_iter()
            .filter(|entry| {
                if !entry.is_expired(now) {
                    return true;
                }
                entry.has_refresh_token()
                    && entry
                        .expires_at
                        .is_some_and(|exp| now - exp < REFRESH_GRACE_SECS)
            })
            .collect();
        write_history(session, &kept);
        if kept.is_empty() {
            warn!("token history pruned to empty");
        }
    }
}
