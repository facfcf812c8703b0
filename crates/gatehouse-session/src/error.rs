//! Session engine error types.

/// Errors that can occur while loading, persisting, or finalizing a session.
///
/// Cryptographic failures on the *read* path are deliberately not represented
/// here: an undecryptable or tampered session cookie is treated as "no
/// session" by the codecs and never surfaces as an error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A cryptographic operation on the write path failed.
    #[error("Crypto error: {message}")]
    Crypto {
        /// Description of the failure.
        message: String,
    },

    /// The backing session store failed.
    ///
    /// Store failures are never swallowed: dropping them would leave the
    /// reference cookie and the store entry out of sync.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// The session configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Session payload serialization failed.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The per-request finalize step was driven incorrectly.
    #[error("Finalize error: {message}")]
    Finalize {
        /// Description of the lifecycle violation.
        message: String,
    },
}

impl SessionError {
    /// Creates a new `Crypto` error.
    #[must_use]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `Finalize` error.
    #[must_use]
    pub fn finalize(message: impl Into<String>) -> Self {
        Self::Finalize {
            message: message.into(),
        }
    }

    /// Returns `true` if this error should surface as a 5xx response.
    ///
    /// Everything in this enum is a server-side fault; the distinction exists
    /// so callers embedding the engine can assert the intent explicitly.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Crypto { .. }
                | Self::Storage { .. }
                | Self::Configuration { .. }
                | Self::Serialization { .. }
                | Self::Finalize { .. }
        )
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
