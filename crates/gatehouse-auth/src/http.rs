//! Axum routes and guards for the authentication engine.
//!
//! [`router`] mounts the configured login, logout, callback, and
//! back-channel-logout routes with the session middleware already applied.
//! [`require_auth`] and [`attempt_silent_login`] are plain middleware
//! functions the application layers onto its own routes.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Form, FromRequest, Query, Request, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use tracing::{info, warn};
use url::form_urlencoded;

use gatehouse_session::{SessionManager, session_from_extensions, session_middleware};

use crate::backchannel::{BackchannelLogout, LogoutClaims};
use crate::client::CallbackParams;
use crate::error::{AuthError, AuthResult};
use crate::orchestrator::{AuthOrchestrator, LoginOptions};

/// Shared state behind every auth route and guard.
#[derive(Clone)]
pub struct AuthState {
    /// The flow orchestrator.
    pub orchestrator: Arc<AuthOrchestrator>,
    /// The session engine.
    pub sessions: Arc<SessionManager>,
    /// Back-channel logout, when the deployment enables it.
    pub backchannel: Option<Arc<BackchannelLogout>>,
}

/// Builds the engine's router: the configured routes plus the session
/// middleware. Routes set to `None` in the configuration are not mounted.
#[must_use]
pub fn router(state: AuthState) -> Router {
    let routes = state.orchestrator.config().routes.clone();
    let mut router = Router::new();
    if let Some(path) = &routes.login {
        router = router.route(path, get(login_handler));
    }
    if let Some(path) = &routes.logout {
        router = router.route(path, get(logout_handler));
    }
    if let Some(path) = &routes.callback {
        router = router.route(path, get(callback_query_handler).post(callback_form_handler));
    }
    if let Some(path) = &routes.backchannel_logout {
        router = router.route(path, any(backchannel_handler));
    }
    router
        .layer(middleware::from_fn_with_state(
            state.sessions.clone(),
            session_middleware,
        ))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ReturnToQuery {
    #[serde(alias = "returnTo")]
    return_to: Option<String>,
}

async fn login_handler(
    State(state): State<AuthState>,
    Query(query): Query<ReturnToQuery>,
    jar: CookieJar,
) -> AuthResult<Response> {
    let options = LoginOptions {
        return_to: query.return_to,
        ..LoginOptions::default()
    };
    let (jar, url) = state.orchestrator.login(jar, None, options).await?;
    Ok((jar, Redirect::temporary(url.as_str())).into_response())
}

async fn logout_handler(
    State(state): State<AuthState>,
    Query(query): Query<ReturnToQuery>,
    jar: CookieJar,
    req: Request,
) -> AuthResult<Response> {
    let handle = session_from_extensions(req.extensions()).map_err(AuthError::from)?;
    let (jar, target) = state
        .orchestrator
        .logout(jar, &handle, query.return_to.as_deref())
        .await?;
    Ok((jar, Redirect::temporary(&target)).into_response())
}

async fn callback_query_handler(
    State(state): State<AuthState>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
    req: Request,
) -> AuthResult<Response> {
    complete_callback(state, jar, params, req.extensions()).await
}

async fn callback_form_handler(
    State(state): State<AuthState>,
    jar: CookieJar,
    req: Request,
) -> AuthResult<Response> {
    let extensions = req.extensions().clone();
    let Form(params) = Form::<CallbackParams>::from_request(req, &())
        .await
        .map_err(|_| AuthError::invalid_request("callback body is not a form"))?;
    complete_callback(state, jar, params, &extensions).await
}

async fn complete_callback(
    state: AuthState,
    jar: CookieJar,
    params: CallbackParams,
    extensions: &axum::http::Extensions,
) -> AuthResult<Response> {
    let handle = session_from_extensions(extensions).map_err(AuthError::from)?;
    let (jar, target) = state.orchestrator.callback(jar, &handle, params).await?;

    // Marker cleanup is best-effort; iat ordering already protects the
    // fresh login from older markers.
    if let Some(backchannel) = &state.backchannel
        && handle.is_authenticated()
        && let Some(mut session) = handle.get()
        && let Err(err) = backchannel
            .on_login(&mut session, state.orchestrator.client().issuer())
            .await
    {
        warn!(error = %err, "could not clear stale back-channel logout markers");
    }

    Ok((jar, Redirect::temporary(&target)).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct BackchannelForm {
    logout_token: Option<String>,
}

fn backchannel_reject(code: &str, description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(serde_json::json!({
            "error": code,
            "error_description": description,
        })),
    )
        .into_response()
}

/// Accepts provider logout notifications.
///
/// Signature verification of the logout token is the protocol client's
/// responsibility and must happen at the JWKS layer in front of this
/// endpoint; the handler enforces the token's structural claims.
async fn backchannel_handler(State(state): State<AuthState>, req: Request) -> Response {
    if req.method() != Method::POST {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(backchannel) = state.backchannel.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let form = Form::<BackchannelForm>::from_request(req, &())
        .await
        .map(|Form(form)| form)
        .unwrap_or_default();
    let Some(token) = form.logout_token else {
        return backchannel_reject("invalid_request", "Missing logout_token");
    };
    let Some(claims) = LogoutClaims::from_token(&token) else {
        return backchannel_reject("invalid_request", "Malformed logout_token");
    };

    match backchannel.on_logout_token(&claims).await {
        Ok(()) => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        }
        Err(err) => err.into_response(),
    }
}

/// Middleware requiring an authenticated session.
///
/// Revoked sessions (back-channel logout) are cleared and treated as
/// anonymous. Anonymous requests are redirected to the login route with the
/// original target as `return_to`, or rejected with 401 when the login
/// route is disabled. Authenticated requests get a request-time token
/// refresh when the configuration enables it.
pub async fn require_auth(State(state): State<AuthState>, req: Request, next: Next) -> Response {
    let handle = match session_from_extensions(req.extensions()) {
        Ok(handle) => handle,
        Err(err) => return AuthError::from(err).into_response(),
    };

    if handle.is_authenticated()
        && let Some(backchannel) = &state.backchannel
    {
        let mut session = handle.get().unwrap_or_default();
        let issuer = state.orchestrator.client().issuer();
        match backchannel.is_logged_out(&mut session, issuer).await {
            Ok(true) => {
                info!("session revoked by back-channel logout");
                handle.clear();
            }
            Ok(false) => {}
            Err(err) => return err.into_response(),
        }
    }

    if handle.is_authenticated() {
        if let Some(mut session) = handle.get() {
            match state
                .orchestrator
                .tokens()
                .maybe_refresh_current(&mut session)
                .await
            {
                Ok(true) => handle.replace(Some(session)),
                Ok(false) => {}
                Err(err) => {
                    // The handler may still work with the expired token;
                    // failing the whole request here would be worse.
                    warn!(error = %err, "request-time token refresh failed");
                }
            }
        }
        return next.run(req).await;
    }

    let target = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    match &state.orchestrator.config().routes.login {
        Some(login_path) => {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("return_to", &target)
                .finish();
            Redirect::temporary(&format!("{login_path}?{query}")).into_response()
        }
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Middleware bouncing first-time anonymous page views through a
/// `prompt=none` login.
///
/// The suppression cookie is set before redirecting, so a provider without
/// a session cannot cause a loop; a successful callback clears it again.
pub async fn attempt_silent_login(
    State(state): State<AuthState>,
    req: Request,
    next: Next,
) -> Response {
    let handle = match session_from_extensions(req.extensions()) {
        Ok(handle) => handle,
        Err(err) => return AuthError::from(err).into_response(),
    };
    let jar = CookieJar::from_headers(req.headers());

    if state.orchestrator.should_attempt_silent_login(&handle, &jar) {
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string());
        let jar = state.orchestrator.cancel_silent_login(jar);
        let options = LoginOptions {
            silent: true,
            ..LoginOptions::default()
        };
        match state
            .orchestrator
            .login(jar, target.as_deref(), options)
            .await
        {
            Ok((jar, url)) => {
                return (jar, Redirect::temporary(url.as_str())).into_response();
            }
            Err(err) => {
                warn!(error = %err, "silent login could not start, continuing anonymously");
            }
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http;
    use axum::routing::get as route_get;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;
    use tower::ServiceExt;
    use url::Url;

    use gatehouse_session::{KeyRing, SessionConfig, TransientCodec};

    use crate::backchannel::MemoryMarkerStore;
    use crate::client::{CallbackChecks, OidcClient, RefreshRequest};
    use crate::config::{AuthConfig, ResponseType};
    use crate::tokens::TokenSet;

    use super::*;

    struct StubClient {
        callbacks: Mutex<Vec<AuthResult<TokenSet>>>,
    }

    #[async_trait]
    impl OidcClient for StubClient {
        fn issuer(&self) -> &str {
            "https://idp.example"
        }

        fn authorization_endpoint(&self) -> Url {
            Url::parse("https://idp.example/authorize").unwrap()
        }

        fn end_session_endpoint(&self) -> Option<Url> {
            None
        }

        async fn callback(
            &self,
            _params: CallbackParams,
            _checks: CallbackChecks,
        ) -> AuthResult<TokenSet> {
            self.callbacks.lock().unwrap().remove(0)
        }

        async fn refresh(
            &self,
            _refresh_token: &str,
            _request: RefreshRequest,
        ) -> AuthResult<TokenSet> {
            Err(AuthError::upstream("not under test"))
        }
    }

    fn fake_jwt(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.sig")
    }

    fn state(callbacks: Vec<AuthResult<TokenSet>>) -> AuthState {
        let keyring = Arc::new(KeyRing::from_secret("test secret").unwrap());
        let config = AuthConfig {
            base_url: Url::parse("https://app.example").unwrap(),
            client_id: "client-1".to_string(),
            client_secret: Some("shh".to_string()),
            response_type: ResponseType::Code,
            ..AuthConfig::default()
        };
        let orchestrator = AuthOrchestrator::new(
            config,
            SessionConfig::default(),
            Arc::new(StubClient {
                callbacks: Mutex::new(callbacks),
            }),
            TransientCodec::new(keyring.clone()),
        )
        .unwrap();
        let sessions =
            Arc::new(SessionManager::cookie(keyring, SessionConfig::default()).unwrap());
        AuthState {
            orchestrator: Arc::new(orchestrator),
            sessions,
            backchannel: Some(Arc::new(BackchannelLogout::new(
                Box::new(MemoryMarkerStore::new()),
                &SessionConfig::default(),
            ))),
        }
    }

    fn logout_token(sub: &str, iat: i64) -> String {
        fake_jwt(&json!({
            "iss": "https://idp.example",
            "sub": sub,
            "iat": iat,
            "events": { "http://schemas.openid.net/event/backchannel-logout": {} },
        }))
    }

    async fn send(router: Router, request: http::Request<Body>) -> http::Response<Body> {
        router.oneshot(request).await.unwrap()
    }

    fn post_form(path: &str, body: &str) -> http::Request<Body> {
        http::Request::post(path)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_route_redirects_to_provider() {
        let response = send(
            router(state(Vec::new())),
            http::Request::get("/login").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("https://idp.example/authorize?"));

        let cookies: Vec<_> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(cookies.iter().any(|c| c.starts_with("auth_verification=")));
    }

    #[tokio::test]
    async fn test_backchannel_logout_accepts_token() {
        let response = send(
            router(state(Vec::new())),
            post_form(
                "/backchannel-logout",
                &format!("logout_token={}", logout_token("user-1", 2000)),
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
    }

    #[tokio::test]
    async fn test_backchannel_logout_missing_token() {
        let response = send(
            router(state(Vec::new())),
            post_form("/backchannel-logout", ""),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid_request");
        assert_eq!(json["error_description"], "Missing logout_token");
    }

    #[tokio::test]
    async fn test_backchannel_logout_rejects_non_post() {
        let response = send(
            router(state(Vec::new())),
            http::Request::get("/backchannel-logout")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_backchannel_logout_rejects_malformed_token() {
        let response = send(
            router(state(Vec::new())),
            post_form("/backchannel-logout", "logout_token=not-a-jwt"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_require_auth_redirects_anonymous() {
        let auth_state = state(Vec::new());
        let app = Router::new()
            .route("/private", route_get(|| async { "secret" }))
            .layer(middleware::from_fn_with_state(
                auth_state.clone(),
                require_auth,
            ))
            .layer(middleware::from_fn_with_state(
                auth_state.sessions.clone(),
                session_middleware,
            ))
            .with_state(());

        let response = send(
            app,
            http::Request::get("/private?tab=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("/login?return_to="));
        assert!(location.contains("%2Fprivate%3Ftab%3D2"));
    }

    #[tokio::test]
    async fn test_require_auth_enforces_backchannel_revocation() {
        let auth_state = state(Vec::new());
        let token = logout_token("user-1", 2_000_000_000);
        let claims = LogoutClaims::from_token(&token).unwrap();
        auth_state
            .backchannel
            .as_ref()
            .unwrap()
            .on_logout_token(&claims)
            .await
            .unwrap();

        // Seed a session cookie for user-1 whose login predates the marker.
        let seed = Router::new()
            .route(
                "/seed",
                route_get(|req: Request| async move {
                    let handle = session_from_extensions(req.extensions()).unwrap();
                    let mut session = gatehouse_session::Session::new();
                    session.insert(
                        "id_token",
                        json!(fake_jwt(&json!({"sub": "user-1", "iat": 1_000_000_000}))),
                    );
                    handle.replace(Some(session));
                    "ok"
                }),
            )
            .layer(middleware::from_fn_with_state(
                auth_state.sessions.clone(),
                session_middleware,
            ));
        let response = send(
            seed,
            http::Request::get("/seed").body(Body::empty()).unwrap(),
        )
        .await;
        let session_cookie = response.headers()["set-cookie"]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let app = Router::new()
            .route("/private", route_get(|| async { "secret" }))
            .layer(middleware::from_fn_with_state(
                auth_state.clone(),
                require_auth,
            ))
            .layer(middleware::from_fn_with_state(
                auth_state.sessions.clone(),
                session_middleware,
            ));
        let response = send(
            app,
            http::Request::get("/private")
                .header("cookie", session_cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        // The revoked session is cleared and the request bounced to login.
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("/login"));
    }

    #[tokio::test]
    async fn test_silent_login_middleware_bounces_first_view() {
        let keyring = Arc::new(KeyRing::from_secret("test secret").unwrap());
        let config = AuthConfig {
            base_url: Url::parse("https://app.example").unwrap(),
            client_id: "client-1".to_string(),
            client_secret: Some("shh".to_string()),
            response_type: ResponseType::Code,
            attempt_silent_login: true,
            ..AuthConfig::default()
        };
        let orchestrator = Arc::new(
            AuthOrchestrator::new(
                config,
                SessionConfig::default(),
                Arc::new(StubClient {
                    callbacks: Mutex::new(Vec::new()),
                }),
                TransientCodec::new(keyring.clone()),
            )
            .unwrap(),
        );
        let sessions =
            Arc::new(SessionManager::cookie(keyring, SessionConfig::default()).unwrap());
        let auth_state = AuthState {
            orchestrator,
            sessions: sessions.clone(),
            backchannel: None,
        };

        let app = || {
            Router::new()
                .route("/page", route_get(|| async { "page" }))
                .layer(middleware::from_fn_with_state(
                    auth_state.clone(),
                    attempt_silent_login,
                ))
                .layer(middleware::from_fn_with_state(
                    sessions.clone(),
                    session_middleware,
                ))
        };

        let response = send(
            app(),
            http::Request::get("/page").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.contains("prompt=none"));
        let cookies: Vec<_> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        let skip = cookies
            .iter()
            .find(|c| c.starts_with("skipSilentLogin="))
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        // With the suppression cookie the page renders anonymously.
        let response = send(
            app(),
            http::Request::get("/page")
                .header("cookie", skip)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_disabled_route_is_not_mounted() {
        let mut auth_state = state(Vec::new());
        let mut config = auth_state.orchestrator.config().clone();
        config.routes.logout = None;
        let keyring = Arc::new(KeyRing::from_secret("test secret").unwrap());
        auth_state.orchestrator = Arc::new(
            AuthOrchestrator::new(
                config,
                SessionConfig::default(),
                Arc::new(StubClient {
                    callbacks: Mutex::new(Vec::new()),
                }),
                TransientCodec::new(keyring),
            )
            .unwrap(),
        );

        let response = send(
            router(auth_state),
            http::Request::get("/logout").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
