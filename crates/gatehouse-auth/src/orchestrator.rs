//! The login, callback, and logout state machine.
//!
//! [`AuthOrchestrator`] composes the protocol client, the session engine,
//! and the token lifecycle into the three flows the HTTP layer exposes. It
//! is transport-agnostic: flows take and return a [`CookieJar`] plus a
//! redirect target, so applications can also drive them from their own
//! handlers when the built-in routes are disabled.

use std::sync::Arc;

use axum_extra::extract::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use gatehouse_session::{
    Session, SessionConfig, SessionHandle, TransientCodec, TransientOptions, decode_claims,
    generate_nonce,
};

use crate::client::{CallbackChecks, CallbackParams, OidcClient};
use crate::config::{AuthConfig, IdpLogoutStyle};
use crate::error::{AuthError, AuthResult};
use crate::pkce::{CODE_CHALLENGE_METHOD, PkcePair};
use crate::state::{LoginState, decode_state, encode_state, resolve_return_to, sanitize_return_to};
use crate::tokens::{TokenLifecycle, TokenSet};

/// Cookie carrying the signed login-attempt record.
pub const VERIFICATION_COOKIE: &str = "auth_verification";

/// Cookie suppressing repeated silent-login attempts.
pub const SKIP_SILENT_LOGIN_COOKIE: &str = "skipSilentLogin";

/// Post-processes the session after a successful callback, before it is
/// installed on the request.
pub type AfterCallbackHook =
    Arc<dyn Fn(&mut Session, &TokenSet) -> AuthResult<()> + Send + Sync>;

/// What travels in the verification cookie across the authorization round
/// trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VerificationRecord {
    nonce: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_age: Option<u64>,
    #[serde(default)]
    silent: bool,
}

impl VerificationRecord {
    fn encode(&self) -> String {
        // Field-only struct; serialization cannot fail.
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Options for starting a login.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// Where to send the user after the callback; overrides the request
    /// path.
    pub return_to: Option<String>,
    /// Attempt the login with `prompt=none`; failures redirect back
    /// without an error page.
    pub silent: bool,
    /// Maximum acceptable authentication age, forwarded as `max_age` and
    /// re-checked on the callback.
    pub max_age: Option<u64>,
    /// Extra authorization parameters appended verbatim.
    pub extra_params: Vec<(String, String)>,
}

/// Drives the relying-party flows against one identity provider.
pub struct AuthOrchestrator {
    config: AuthConfig,
    session_config: SessionConfig,
    client: Arc<dyn OidcClient>,
    transient: TransientCodec,
    tokens: TokenLifecycle,
    after_callback: Option<AfterCallbackHook>,
}

impl AuthOrchestrator {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `config` is invalid.
    pub fn new(
        config: AuthConfig,
        session_config: SessionConfig,
        client: Arc<dyn OidcClient>,
        transient: TransientCodec,
    ) -> AuthResult<Self> {
        config.validate()?;
        let tokens = TokenLifecycle::new(config.tokens.clone(), client.clone());
        Ok(Self {
            config,
            session_config,
            client,
            transient,
            tokens,
            after_callback: None,
        })
    }

    /// Installs a post-callback hook.
    #[must_use]
    pub fn with_after_callback(mut self, hook: AfterCallbackHook) -> Self {
        self.after_callback = Some(hook);
        self
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// The protocol client the orchestrator drives.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn OidcClient> {
        &self.client
    }

    /// The token lifecycle bound to this orchestrator.
    #[must_use]
    pub fn tokens(&self) -> &TokenLifecycle {
        &self.tokens
    }

    fn transient_options(&self) -> TransientOptions {
        TransientOptions {
            secure: self.config.wants_secure_cookies(),
            domain: self.session_config.cookie.domain.clone(),
            legacy_fallback: self.session_config.legacy_same_site_cookie,
            ..TransientOptions::default()
        }
    }

    // ========================================================================
    // Login
    // ========================================================================

    /// Starts a login: records the attempt in the verification cookie and
    /// returns the authorization redirect.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the callback route is disabled
    /// and an upstream error when a PAR push fails.
    pub async fn login(
        &self,
        jar: CookieJar,
        request_path: Option<&str>,
        options: LoginOptions,
    ) -> AuthResult<(CookieJar, Url)> {
        let redirect_uri = self.config.redirect_uri()?;
        let return_to = resolve_return_to(
            options.return_to.as_deref(),
            request_path,
            &self.config.base_url,
        );
        let state = encode_state(&LoginState {
            return_to: Some(return_to),
        });
        let nonce = generate_nonce();

        let mut params: Vec<(String, String)> = vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            (
                "response_type".to_string(),
                self.config.response_type.as_str().to_string(),
            ),
            ("scope".to_string(), self.config.scope.clone()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("nonce".to_string(), nonce.clone()),
            ("state".to_string(), state.clone()),
        ];
        if self.config.response_type.includes_id_token() {
            // Front-channel tokens must not land in a query string.
            params.push(("response_mode".to_string(), "form_post".to_string()));
        }
        if let Some(audience) = &self.config.audience {
            params.push(("audience".to_string(), audience.clone()));
        }

        let code_verifier = if self.config.response_type.includes_code() {
            let pkce = PkcePair::generate();
            params.push((
                "code_challenge".to_string(),
                pkce.challenge().to_string(),
            ));
            params.push((
                "code_challenge_method".to_string(),
                CODE_CHALLENGE_METHOD.to_string(),
            ));
            Some(pkce.verifier().to_string())
        } else {
            None
        };

        if options.silent {
            params.push(("prompt".to_string(), "none".to_string()));
        }
        if let Some(max_age) = options.max_age {
            params.push(("max_age".to_string(), max_age.to_string()));
        }
        params.extend(options.extra_params.clone());

        let record = VerificationRecord {
            nonce,
            state,
            code_verifier,
            max_age: options.max_age,
            silent: options.silent,
        };
        let (jar, _) = self.transient.store(
            jar,
            VERIFICATION_COOKIE,
            Some(record.encode()),
            &self.transient_options(),
        );

        if self.config.use_par
            && let Some(request_uri) = self.client.pushed_authorization_request(&params).await?
        {
            params = vec![
                ("client_id".to_string(), self.config.client_id.clone()),
                ("request_uri".to_string(), request_uri),
            ];
        }

        let mut url = self.client.authorization_endpoint();
        url.query_pairs_mut().extend_pairs(&params);
        debug!(silent = options.silent, "starting login");
        Ok((jar, url))
    }

    // ========================================================================
    // Callback
    // ========================================================================

    /// Completes a login from the provider's callback.
    ///
    /// Returns the jar and where to redirect the user. A failed silent
    /// attempt is not an error: the suppression cookie is set and the user
    /// continues to their original destination anonymously.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingVerification`] when no login attempt is
    /// pending, a protocol error when validation fails on an interactive
    /// attempt, and a hook error when the post-callback hook rejects.
    pub async fn callback(
        &self,
        jar: CookieJar,
        handle: &SessionHandle,
        params: CallbackParams,
    ) -> AuthResult<(CookieJar, String)> {
        let (jar, raw) =
            self.transient
                .get_once(jar, VERIFICATION_COOKIE, &self.transient_options());
        let Some(record) = raw.as_deref().and_then(VerificationRecord::decode) else {
            return Err(AuthError::MissingVerification);
        };

        let return_to = decode_state(&record.state)
            .and_then(|s| s.return_to)
            .unwrap_or_else(|| self.config.base_url.as_str().to_string());

        let checks = CallbackChecks {
            nonce: Some(record.nonce.clone()),
            state: Some(record.state.clone()),
            code_verifier: record.code_verifier.clone(),
            max_age: record.max_age,
        };
        let token_set = match self.client.callback(params, checks).await {
            Ok(token_set) => token_set,
            Err(err) if record.silent => {
                // The provider had no session to reuse, or could not be
                // reached at all. A silent attempt rides an ordinary page
                // view, so the user goes through anonymously either way.
                debug!(error = %err, "silent login failed");
                let jar = self.cancel_silent_login(jar);
                return Ok((jar, return_to));
            }
            Err(err) => return Err(err),
        };

        let subject = token_set
            .id_token
            .as_deref()
            .and_then(decode_claims)
            .and_then(|claims| claims.get("sub").and_then(|s| s.as_str().map(str::to_string)));

        // Same user again: keep their session data. Anyone else — a
        // different user, or no prior login — gets a session whose backing
        // id a pre-login cookie can never address.
        let (mut session, regenerate) = match handle.get() {
            Some(mut current) if current.is_authenticated() => {
                if current.subject() == subject {
                    (current, false)
                } else {
                    info!("identity changed at callback, discarding previous session");
                    (Session::new(), true)
                }
            }
            Some(current) => (current, true),
            None => (Session::new(), true),
        };

        self.tokens.set_current(&mut session, token_set.clone());
        if let Some(hook) = &self.after_callback {
            // A rejecting hook aborts the login; the request keeps the
            // session it came in with.
            hook(&mut session, &token_set)?;
        }

        handle.replace(Some(session));
        if regenerate {
            handle.mark_regenerate();
        }
        let jar = self.resume_silent_login(jar);
        info!("login completed");
        Ok((jar, return_to))
    }

    // ========================================================================
    // Logout
    // ========================================================================

    /// Clears the session and resolves where to send the user.
    ///
    /// With `idp_logout` enabled the redirect goes through the provider's
    /// logout endpoint so the provider session ends too.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the provider publishes no logout
    /// endpoint for the configured style.
    pub async fn logout(
        &self,
        jar: CookieJar,
        handle: &SessionHandle,
        return_to: Option<&str>,
    ) -> AuthResult<(CookieJar, String)> {
        let local_target = return_to
            .and_then(sanitize_return_to)
            .unwrap_or_else(|| self.config.base_url.as_str().to_string());
        // The next anonymous page view must not bounce straight back
        // through a silent login.
        let jar = self.cancel_silent_login(jar);

        if !handle.is_authenticated() {
            return Ok((jar, local_target));
        }

        let id_token_hint = handle.get().and_then(|s| s.id_token().map(str::to_string));
        handle.clear();

        if !self.config.idp_logout {
            info!("logout completed");
            return Ok((jar, local_target));
        }

        let post_logout = self
            .config
            .base_url
            .join(&local_target)
            .map_err(|e| AuthError::configuration(format!("invalid return target: {e}")))?;

        let target = match self.config.idp_logout_style {
            IdpLogoutStyle::EndSession => match self.client.end_session_endpoint() {
                Some(mut endpoint) => {
                    {
                        let mut query = endpoint.query_pairs_mut();
                        query.append_pair("client_id", &self.config.client_id);
                        query.append_pair("post_logout_redirect_uri", post_logout.as_str());
                        if let Some(hint) = &id_token_hint {
                            query.append_pair("id_token_hint", hint);
                        }
                    }
                    endpoint.to_string()
                }
                None => {
                    warn!("provider publishes no end_session_endpoint, logging out locally");
                    local_target
                }
            },
            IdpLogoutStyle::VendorV2 => {
                let mut endpoint = Url::parse(self.client.issuer())
                    .and_then(|base| base.join("/v2/logout"))
                    .map_err(|e| {
                        AuthError::configuration(format!("issuer is not a valid URL: {e}"))
                    })?;
                endpoint
                    .query_pairs_mut()
                    .append_pair("client_id", &self.config.client_id)
                    .append_pair("returnTo", post_logout.as_str());
                endpoint.to_string()
            }
        };
        info!("logout completed");
        Ok((jar, target))
    }

    // ========================================================================
    // Silent login
    // ========================================================================

    /// Whether this request should be bounced through a silent login.
    #[must_use]
    pub fn should_attempt_silent_login(&self, handle: &SessionHandle, jar: &CookieJar) -> bool {
        self.config.attempt_silent_login
            && !handle.is_authenticated()
            && jar.get(SKIP_SILENT_LOGIN_COOKIE).is_none()
    }

    /// Sets the suppression cookie so silent login is not retried.
    #[must_use]
    pub fn cancel_silent_login(&self, jar: CookieJar) -> CookieJar {
        let cookie = Cookie::build((SKIP_SILENT_LOGIN_COOKIE, "true"))
            .http_only(true)
            .secure(self.config.wants_secure_cookies())
            .same_site(SameSite::None)
            .path("/")
            .build();
        jar.add(cookie)
    }

    /// Removes the suppression cookie, re-arming silent login.
    #[must_use]
    pub fn resume_silent_login(&self, jar: CookieJar) -> CookieJar {
        jar.remove(Cookie::build((SKIP_SILENT_LOGIN_COOKIE, "")).path("/").build())
    }
}
