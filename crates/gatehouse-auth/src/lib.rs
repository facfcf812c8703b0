//! # gatehouse-auth
//!
//! OIDC relying-party flows on top of [`gatehouse_session`]: interactive
//! and silent login, callback validation, local and provider logout, token
//! compatibility matching with refresh, and back-channel logout.
//!
//! The wire protocol lives behind the [`client::OidcClient`] trait; this
//! crate owns everything around it — redirect construction, the signed
//! verification cookie, session install rules, and the HTTP routes.
//!
//! ## Modules
//!
//! - [`config`] - Engine configuration and route mounts
//! - [`orchestrator`] - The login/callback/logout state machine
//! - [`client`] - The protocol-client seam and discovery cache
//! - [`tokens`] - Token sets, matching, refresh, and history
//! - [`backchannel`] - Back-channel logout markers
//! - [`state`] - `state` parameter payload and return-target hygiene
//! - [`pkce`] - PKCE verifier/challenge generation
//! - [`http`] - Axum routes and guards

pub mod backchannel;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod pkce;
pub mod state;
pub mod tokens;

pub use backchannel::{BackchannelLogout, LogoutClaims, LogoutMarkerStore, MemoryMarkerStore};
pub use client::{CallbackChecks, CallbackParams, DiscoveryCache, OidcClient, RefreshRequest};
pub use config::{AuthConfig, IdpLogoutStyle, ResponseType, RoutesConfig};
pub use error::{AuthError, AuthResult, ErrorCategory};
pub use http::{AuthState, attempt_silent_login, require_auth, router};
pub use orchestrator::{
    AfterCallbackHook, AuthOrchestrator, LoginOptions, SKIP_SILENT_LOGIN_COOKIE,
    VERIFICATION_COOKIE,
};
pub use pkce::PkcePair;
pub use state::{LoginState, decode_state, encode_state, resolve_return_to, sanitize_return_to};
pub use tokens::{
    DEFAULT_SCOPE, TokenLifecycle, TokenLifecycleConfig, TokenQuery, TokenSet, apply_token_set,
    current_token_set, token_history,
};
