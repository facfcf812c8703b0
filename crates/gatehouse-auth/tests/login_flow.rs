//! End-to-end flow over the mounted routes: login redirect, callback with
//! the verification cookie, an authenticated page view, and logout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{self, StatusCode};
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower::ServiceExt;
use url::Url;

use gatehouse_auth::{
    AuthConfig, AuthError, AuthOrchestrator, AuthResult, AuthState, CallbackChecks,
    CallbackParams, OidcClient, RefreshRequest, ResponseType, TokenSet, require_auth, router,
};
use gatehouse_session::{
    KeyRing, Session, SessionConfig, SessionManager, TransientCodec, session_from_extensions,
    session_middleware,
};

fn fake_jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.sig")
}

/// Stub provider: records the checks the engine hands over and answers the
/// token exchange.
struct StubProvider {
    seen_checks: Mutex<Vec<CallbackChecks>>,
    subject: String,
}

#[async_trait]
impl OidcClient for StubProvider {
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
        params: CallbackParams,
        checks: CallbackChecks,
    ) -> AuthResult<TokenSet> {
        if params.code.as_deref() != Some("code-123") {
            return Err(AuthError::protocol("invalid_grant", "unknown code"));
        }
        if params.state != checks.state {
            return Err(AuthError::protocol("invalid_request", "state mismatch"));
        }
        self.seen_checks.lock().unwrap().push(checks);
        Ok(TokenSet {
            id_token: Some(fake_jwt(&json!({
                "sub": self.subject,
                "iat": 1_700_000_000,
            }))),
            access_token: Some("at-1".to_string()),
            refresh_token: None,
            token_type: Some("Bearer".to_string()),
            expires_at: None,
            scope: None,
            audience: None,
            organization: None,
        })
    }

    async fn refresh(
        &self,
        _refresh_token: &str,
        _request: RefreshRequest,
    ) -> AuthResult<TokenSet> {
        Err(AuthError::upstream("refresh not under test"))
    }
}

struct TestApp {
    router: Router,
    provider: Arc<StubProvider>,
    cookies: HashMap<String, String>,
}

impl TestApp {
    fn new() -> Self {
        let keyring = Arc::new(KeyRing::from_secret("integration secret").unwrap());
        let provider = Arc::new(StubProvider {
            seen_checks: Mutex::new(Vec::new()),
            subject: "user-1".to_string(),
        });
        let config = AuthConfig {
            base_url: Url::parse("https://app.example").unwrap(),
            client_id: "client-1".to_string(),
            client_secret: Some("shh".to_string()),
            response_type: ResponseType::Code,
            ..AuthConfig::default()
        };
        let orchestrator = Arc::new(
            AuthOrchestrator::new(
                config,
                SessionConfig::default(),
                provider.clone(),
                TransientCodec::new(keyring.clone()),
            )
            .unwrap(),
        );
        let sessions =
            Arc::new(SessionManager::cookie(keyring, SessionConfig::default()).unwrap());
        let state = AuthState {
            orchestrator,
            sessions: sessions.clone(),
            backchannel: None,
        };

        let profile = Router::new()
            .route(
                "/profile",
                get(|req: axum::extract::Request| async move {
                    let handle = session_from_extensions(req.extensions()).unwrap();
                    let sub = handle.get().unwrap_or_else(Session::new).subject();
                    Json(json!({ "sub": sub }))
                }),
            )
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .layer(middleware::from_fn_with_state(sessions, session_middleware));

        Self {
            router: router(state).merge(profile),
            provider,
            cookies: HashMap::new(),
        }
    }

    fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn absorb_cookies(&mut self, response: &http::Response<Body>) {
        for value in response.headers().get_all("set-cookie") {
            let raw = value.to_str().unwrap();
            let pair = raw.split(';').next().unwrap();
            let (name, value) = pair.split_once('=').unwrap();
            if value.is_empty() {
                self.cookies.remove(name);
            } else {
                self.cookies.insert(name.to_string(), value.to_string());
            }
        }
    }

    async fn get(&mut self, path: &str) -> http::Response<Body> {
        let mut request = http::Request::get(path);
        if !self.cookies.is_empty() {
            request = request.header("cookie", self.cookie_header());
        }
        let response = self
            .router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        self.absorb_cookies(&response);
        response
    }
}

fn location(response: &http::Response<Body>) -> String {
    response.headers()["location"].to_str().unwrap().to_string()
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_full_login_logout_flow() {
    let mut app = TestApp::new();

    // Anonymous page view bounces through the login route.
    let response = app.get("/profile").await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert!(location(&response).starts_with("/login?return_to=%2Fprofile"));

    // The login route answers with the authorization redirect and sets the
    // verification cookie.
    let response = app.get("/login?return_to=/profile").await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let authorize = Url::parse(&location(&response)).unwrap();
    assert_eq!(authorize.host_str(), Some("idp.example"));
    let params = query_map(&authorize);
    assert!(app.cookies.contains_key("auth_verification"));
    assert!(app.cookies.contains_key("_auth_verification"));

    // Provider redirects back with code and the echoed state.
    let response = app
        .get(&format!("/callback?code=code-123&state={}", params["state"]))
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), "/profile");

    // The verification cookie is consumed; the session cookie is set.
    assert!(!app.cookies.contains_key("auth_verification"));
    assert!(app.cookies.contains_key("appSession"));

    // The PKCE verifier only ever lived in the transient cookie; its S256
    // hash must be the challenge that went to the provider.
    let checks = app.provider.seen_checks.lock().unwrap().pop().unwrap();
    let verifier = checks.code_verifier.unwrap();
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    assert_eq!(challenge, params["code_challenge"]);
    assert_eq!(checks.nonce.as_deref(), Some(params["nonce"].as_str()));

    // The protected page now renders with the user's subject.
    let response = app.get("/profile").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["sub"], "user-1");

    // Logout clears the session and lands on the base URL.
    let response = app.get("/logout").await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), "https://app.example/");
    assert!(!app.cookies.contains_key("appSession"));

    // Back to anonymous.
    let response = app.get("/profile").await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert!(location(&response).starts_with("/login"));
}

#[tokio::test]
async fn test_callback_replay_is_rejected() {
    let mut app = TestApp::new();

    let response = app.get("/login").await;
    let params = query_map(&Url::parse(&location(&response)).unwrap());
    let callback_path = format!("/callback?code=code-123&state={}", params["state"]);

    let response = app.get(&callback_path).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    // The verification record was single-use.
    let response = app.get(&callback_path).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_provider_error_surfaces_on_callback() {
    let mut app = TestApp::new();

    let response = app.get("/login").await;
    let params = query_map(&Url::parse(&location(&response)).unwrap());

    // Wrong code: the stub rejects the exchange.
    let response = app
        .get(&format!("/callback?code=wrong&state={}", params["state"]))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "invalid_grant");
}
