use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a provider produced no usage data this cycle.
///
/// Every variant ends the provider's fetch; it is carried on the
/// `UsageResult` rather than returned past the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    #[error("{message}")]
    CredentialsMissingOrMalformed { message: String },

    #[error("no refresh token found")]
    NoRefreshToken,

    #[error("token refresh failed: {message}")]
    RefreshFailed { message: String },

    #[error("auth expired; {hint} ({source})")]
    AuthRecoveryFailed {
        hint: String,
        source: Box<FetchError>,
    },

    #[error("token refresh succeeded, but failed to save updated tokens: {message}")]
    PersistAfterRefreshFailed { message: String },

    #[error("auth expired; {hint} (HTTP {status})")]
    AuthStillFailing { status: u16, hint: String },

    #[error("request failed: {message}")]
    Transport { message: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl FetchError {
    pub fn credentials(message: impl Into<String>) -> Self {
        FetchError::CredentialsMissingOrMalformed {
            message: message.into(),
        }
    }

    pub fn refresh_failed(message: impl Into<String>) -> Self {
        FetchError::RefreshFailed {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        FetchError::Transport {
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        FetchError::InvalidResponse {
            message: message.into(),
        }
    }

    /// True when the user has to log in again before the next cycle can succeed.
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            FetchError::NoRefreshToken
                | FetchError::RefreshFailed { .. }
                | FetchError::AuthRecoveryFailed { .. }
                | FetchError::PersistAfterRefreshFailed { .. }
                | FetchError::AuthStillFailing { .. }
        )
    }

    /// Coarse UI hint: `!` needs re-authentication, `?` is transient or unknown.
    pub fn short_marker(&self) -> &'static str {
        if self.needs_login() {
            "!"
        } else {
            "?"
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::DeadlineExceeded
        } else {
            FetchError::transport(err.to_string())
        }
    }
}
