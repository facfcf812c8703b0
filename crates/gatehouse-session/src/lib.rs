//! # gatehouse-session
//!
//! Encrypted, tamper-evident session state for the Gatehouse OIDC
//! relying-party middleware.
//!
//! This crate provides:
//! - Key derivation and rotation from operator secrets ([`KeyRing`])
//! - Authenticated encryption of session payloads ([`SessionCodec`])
//! - Signed, single-read protocol-state cookies ([`TransientCodec`])
//! - Cookie-backed persistence with chunking ([`store::CookieSessionStore`])
//! - An adapter contract for external key/value stores ([`store::SessionStore`])
//! - Per-request load/finalize orchestration ([`SessionManager`])
//!
//! ## Modules
//!
//! - [`keyring`] - Secret-to-key derivation and rotation
//! - [`codec`] - Session payload encryption
//! - [`transient`] - Signed single-read cookies for login state
//! - [`store`] - Cookie and external-store backends
//! - [`session`] - The session value and its claims view
//! - [`handle`] - Request-scoped session handle
//! - [`middleware`] - Axum integration and write-back scheduling
//! - [`config`] - Session configuration

pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod keyring;
pub mod middleware;
pub mod session;
pub mod store;
pub mod transient;

pub use codec::{SessionCodec, SessionHeader};
pub use config::{ConfigError, CookieConfig, SameSitePolicy, SessionConfig};
pub use error::SessionError;
pub use handle::{FinalizeState, SessionHandle};
pub use keyring::{KeyMaterial, KeyRing};
pub use middleware::{SessionManager, session_from_extensions, session_middleware};
pub use session::{Session, decode_claims};
pub use store::{
    CookieSessionStore, ExternalStoreAdapter, IdGenerator, MemorySessionStore, SessionStore,
    StoredSession, MAX_COOKIE_SIZE,
};
pub use transient::{TransientCodec, TransientOptions, generate_nonce};

/// Type alias for session engine results.
pub type SessionResult<T> = Result<T, SessionError>;
