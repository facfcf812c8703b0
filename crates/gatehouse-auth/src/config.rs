//! Authentication engine configuration.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, AuthResult};
use crate::tokens::{DEFAULT_SCOPE, TokenLifecycleConfig};

/// OAuth response type for the authorization request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    /// `id_token` only: authentication without API access.
    #[default]
    #[serde(rename = "id_token")]
    IdToken,
    /// Authorization code flow.
    #[serde(rename = "code")]
    Code,
    /// Hybrid flow.
    #[serde(rename = "code id_token")]
    CodeIdToken,
}

impl ResponseType {
    /// The wire value for the `response_type` parameter.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdToken => "id_token",
            Self::Code => "code",
            Self::CodeIdToken => "code id_token",
        }
    }

    /// Returns `true` when the flow includes an authorization code.
    #[must_use]
    pub fn includes_code(self) -> bool {
        matches!(self, Self::Code | Self::CodeIdToken)
    }

    /// Returns `true` when tokens come back on the front channel.
    #[must_use]
    pub fn includes_id_token(self) -> bool {
        matches!(self, Self::IdToken | Self::CodeIdToken)
    }
}

/// How to end the provider session on logout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdpLogoutStyle {
    /// OIDC RP-initiated logout via the discovered `end_session_endpoint`.
    #[default]
    EndSession,
    /// The `/v2/logout` endpoint some providers expose instead, addressed
    /// with `client_id` and `returnTo`.
    VendorV2,
}

/// Mount points for the engine's HTTP routes.
///
/// Each route can be disabled by setting it to `None`, for applications
/// that drive the orchestrator from their own handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RoutesConfig {
    /// Path starting an interactive login.
    pub login: Option<String>,
    /// Path clearing the session and optionally ending the provider session.
    pub logout: Option<String>,
    /// Path the provider redirects back to.
    pub callback: Option<String>,
    /// Path receiving back-channel logout tokens.
    pub backchannel_logout: Option<String>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            login: Some("/login".to_string()),
            logout: Some("/logout".to_string()),
            callback: Some("/callback".to_string()),
            backchannel_logout: Some("/backchannel-logout".to_string()),
        }
    }
}

/// Top-level configuration for the authentication engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AuthConfig {
    /// Public base URL of the application, used to build the redirect URI
    /// and as the default post-login and post-logout target.
    pub base_url: Url,
    /// OAuth client identifier.
    pub client_id: String,
    /// OAuth client secret; required for code-bearing response types.
    pub client_secret: Option<String>,
    /// Response type for the authorization request.
    pub response_type: ResponseType,
    /// Space-separated scope; must contain `openid`.
    pub scope: String,
    /// Default audience for authorization requests.
    pub audience: Option<String>,
    /// Route mount points.
    pub routes: RoutesConfig,
    /// Require authentication on every route behind the guard middleware.
    pub auth_required: bool,
    /// Try a `prompt=none` login for anonymous page views.
    pub attempt_silent_login: bool,
    /// End the provider session on logout.
    pub idp_logout: bool,
    /// How to end the provider session.
    pub idp_logout_style: IdpLogoutStyle,
    /// Push authorization parameters (RFC 9126) instead of sending them in
    /// the redirect.
    pub use_par: bool,
    /// Token lifecycle tuning.
    pub tokens: TokenLifecycleConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            // Development placeholder; operators set their own.
            base_url: Url::parse("http://localhost:3000").expect("static url literal parses"),
            client_id: String::new(),
            client_secret: None,
            response_type: ResponseType::default(),
            scope: DEFAULT_SCOPE.to_string(),
            audience: None,
            routes: RoutesConfig::default(),
            auth_required: true,
            attempt_silent_login: false,
            idp_logout: false,
            idp_logout_style: IdpLogoutStyle::default(),
            use_par: false,
            tokens: TokenLifecycleConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Checks invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the client id is empty, the scope
    /// lacks `openid`, a code-bearing response type has no client secret,
    /// or the base URL is not http(s).
    pub fn validate(&self) -> AuthResult<()> {
        if self.client_id.is_empty() {
            return Err(AuthError::configuration("client_id must be set"));
        }
        if !self.scope.split_whitespace().any(|s| s == "openid") {
            return Err(AuthError::configuration(
                "scope must contain the openid scope",
            ));
        }
        if self.response_type.includes_code() && self.client_secret.is_none() {
            return Err(AuthError::configuration(
                "code-bearing response types require a client_secret",
            ));
        }
        match self.base_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(AuthError::configuration(format!(
                    "base_url scheme must be http or https, got {other}"
                )));
            }
        }
        Ok(())
    }

    /// The redirect URI registered with the provider.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the callback route is disabled.
    pub fn redirect_uri(&self) -> AuthResult<Url> {
        let path = self.routes.callback.as_deref().ok_or_else(|| {
            AuthError::configuration("callback route is disabled; no redirect_uri available")
        })?;
        self.base_url
            .join(path)
            .map_err(|e| AuthError::configuration(format!("invalid callback path: {e}")))
    }

    /// Whether cookies should carry the `Secure` attribute.
    #[must_use]
    pub fn wants_secure_cookies(&self) -> bool {
        self.base_url.scheme() == "https"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AuthConfig {
        AuthConfig {
            base_url: Url::parse("https://app.example").unwrap(),
            client_id: "client-1".to_string(),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_scope_must_contain_openid() {
        let config = AuthConfig {
            scope: "profile email".to_string(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_code_flow_requires_secret() {
        let config = AuthConfig {
            response_type: ResponseType::Code,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = AuthConfig {
            response_type: ResponseType::Code,
            client_secret: Some("shh".to_string()),
            ..valid()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_redirect_uri_joins_callback_route() {
        assert_eq!(
            valid().redirect_uri().unwrap().as_str(),
            "https://app.example/callback"
        );

        let config = AuthConfig {
            routes: RoutesConfig {
                callback: None,
                ..RoutesConfig::default()
            },
            ..valid()
        };
        assert!(config.redirect_uri().is_err());
    }

    #[test]
    fn test_response_type_wire_values() {
        assert_eq!(ResponseType::IdToken.as_str(), "id_token");
        assert_eq!(ResponseType::CodeIdToken.as_str(), "code id_token");
        assert!(ResponseType::CodeIdToken.includes_code());
        assert!(!ResponseType::IdToken.includes_code());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: AuthConfig = serde_json::from_str(
            r#"{"base_url": "https://app.example", "client_id": "client-1"}"#,
        )
        .unwrap();
        assert_eq!(config.scope, DEFAULT_SCOPE);
        assert_eq!(config.routes.login.as_deref(), Some("/login"));
        assert_eq!(config.response_type, ResponseType::IdToken);
    }
}
