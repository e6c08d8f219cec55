//! Error taxonomy for triage operations.
//!
//! Errors fall into four classes, each handled differently:
//! - Transient upstream (LLM/provider non-2xx, network): logged, the row
//!   stays in its prior state for a later retry, loops continue.
//! - Data integrity (missing message/workspace/profile): skip the unit of
//!   work, no retry.
//! - Auth (bad bearer, unmatched verify token): reject immediately.
//! - Crypto (bad key/ciphertext): fatal for that operation, never a
//!   plaintext fallback.

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API error {status}: {message}")]
    LlmApi { status: u16, message: String },

    #[error("LLM returned invalid classification JSON: {0}")]
    InvalidLlmOutput(String),

    #[error("provider API error {status}: {message}")]
    ProviderApi { status: u16, message: String },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TriageError {
    /// Whether a later re-invocation of the same operation can succeed.
    ///
    /// Retryable errors leave the affected row in its prior state so the
    /// batch/sweep path picks it up again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::InvalidLlmOutput(_) => true,
            Self::LlmApi { status, .. } | Self::ProviderApi { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}
