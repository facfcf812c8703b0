//! Login state: the `state` parameter payload and return-target hygiene.
//!
//! The OAuth `state` parameter doubles as CSRF binding and as the carrier
//! for where to send the user after the callback. The payload is base64url
//! JSON; integrity comes from the signed transient cookie it is compared
//! against, not from the encoding.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use url::Url;

/// Application state carried through the authorization round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    /// Path to redirect to after a successful callback.
    #[serde(rename = "returnTo", skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
}

/// Encodes login state as base64url JSON for the `state` parameter.
#[must_use]
pub fn encode_state(state: &LoginState) -> String {
    // LoginState contains only strings; serialization cannot fail.
    let json = serde_json::to_vec(state).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decodes a `state` parameter back into login state.
///
/// Returns `None` for anything that is not base64url JSON of the expected
/// shape; the caller falls back to the application base URL.
#[must_use]
pub fn decode_state(raw: &str) -> Option<LoginState> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Sanitizes a post-login redirect target to a same-origin path.
///
/// Absolute URLs and protocol-relative targets (`//evil.example`) are
/// rejected; anything else is normalized to a single-leading-slash path.
/// Returns `None` when the target cannot be made safe.
#[must_use]
pub fn sanitize_return_to(target: &str) -> Option<String> {
    if target.is_empty() {
        return None;
    }
    // An absolute URL means the caller is trying to leave the origin.
    if Url::parse(target).is_ok() {
        return None;
    }
    if !target.starts_with('/') {
        return None;
    }
    // Collapse leading slashes: browsers treat "//host" as scheme-relative.
    let trimmed = target.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some("/".to_string());
    }
    // A backslash survives normalization in some user agents the same way a
    // slash does.
    if trimmed.starts_with('\\') {
        return None;
    }
    Some(format!("/{trimmed}"))
}

/// Picks the post-login return target.
///
/// Precedence: an explicit target from the caller, then the path of the
/// request that triggered the login, then the application base URL. Unsafe
/// candidates are skipped rather than erroring.
#[must_use]
pub fn resolve_return_to(
    explicit: Option<&str>,
    request_path: Option<&str>,
    base_url: &Url,
) -> String {
    explicit
        .and_then(sanitize_return_to)
        .or_else(|| request_path.and_then(sanitize_return_to))
        .unwrap_or_else(|| base_url.as_str().to_string())
}
