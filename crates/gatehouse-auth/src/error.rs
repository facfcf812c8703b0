//! Error types for the authentication engine.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gatehouse_session::SessionError;
use serde_json::json;
use thiserror::Error;

/// Coarse error classification for logging and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A bad or out-of-sequence request, including provider callback
    /// errors. Surfaced to the caller as a 400-class response.
    Protocol,
    /// The engine is set up wrong. Fatal, not retryable.
    Configuration,
    /// A shared store failed; continuing would let cookie and store
    /// state diverge.
    Storage,
    /// An operator-supplied hook rejected the flow.
    Hook,
    /// The identity provider is unreachable or misbehaving.
    Upstream,
    /// The session engine failed underneath the flow.
    Session,
}

/// Errors raised by the login, callback, logout, and token flows.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The request is malformed or missing required parameters.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// The identity provider returned a protocol error on the callback.
    ///
    /// The provider's `error` code and `error_description` are preserved
    /// verbatim so the operator can act on them.
    #[error("identity provider returned {code}: {description}")]
    Protocol {
        /// The OAuth error code from the provider.
        code: String,
        /// The provider's human-readable description.
        description: String,
    },

    /// The callback arrived without a matching login attempt.
    #[error("callback received with no pending login verification")]
    MissingVerification,

    /// The engine is misconfigured.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A back-channel logout store operation failed.
    #[error("logout store error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// The operator's post-callback hook rejected the session.
    #[error("callback hook failed: {message}")]
    Hook {
        /// The hook's failure message.
        message: String,
    },

    /// The identity provider could not be reached or answered abnormally.
    #[error("identity provider unavailable: {message}")]
    Upstream {
        /// Description of the upstream failure.
        message: String,
    },

    /// The session engine failed underneath the auth flow.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl AuthError {
    /// Creates an [`AuthError::InvalidRequest`].
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an [`AuthError::Protocol`] from a provider error response.
    #[must_use]
    pub fn protocol(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Protocol {
            code: code.into(),
            description: description.into(),
        }
    }

    /// Creates an [`AuthError::Configuration`].
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an [`AuthError::Storage`].
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates an [`AuthError::Hook`].
    #[must_use]
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook {
            message: message.into(),
        }
    }

    /// Creates an [`AuthError::Upstream`].
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// The OAuth error code to put on the wire for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &str {
        match self {
            Self::InvalidRequest { .. } | Self::MissingVerification => "invalid_request",
            Self::Protocol { code, .. } => code,
            Self::Configuration { .. } | Self::Hook { .. } | Self::Session(_) => "server_error",
            Self::Storage { .. } => "application_error",
            Self::Upstream { .. } => "temporarily_unavailable",
        }
    }

    /// This error's place in the handling taxonomy.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidRequest { .. } | Self::MissingVerification | Self::Protocol { .. } => {
                ErrorCategory::Protocol
            }
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Hook { .. } => ErrorCategory::Hook,
            Self::Upstream { .. } => ErrorCategory::Upstream,
            Self::Session(_) => ErrorCategory::Session,
        }
    }

    /// Returns `true` when the error is the caller's fault.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.category() == ErrorCategory::Protocol
    }

    /// Returns `true` when the error is on this side of the wire.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::MissingVerification | Self::Protocol { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Storage { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } | Self::Hook { .. } | Self::Session(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "auth request failed");
        } else {
            tracing::debug!(error = %self, "auth request rejected");
        }
        // Server-side detail stays in the log; the body carries only the
        // OAuth-shaped code and a safe description.
        let description = if status.is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = Json(json!({
            "error": self.oauth_error_code(),
            "error_description": description,
        }));
        (status, body).into_response()
    }
}

/// Type alias for authentication results.
pub type AuthResult<T> = Result<T, AuthError>;
