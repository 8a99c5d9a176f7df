pub mod bridge;
pub mod http;
pub mod probe;
pub mod retry;
pub mod signing;

use std::time::Duration;
use thiserror::Error;

use crate::identity::secrets::SecretError;

/// Wire-level error codes the relay returns in response bodies.
pub mod codes {
    pub const MISSING_TOKEN: &str = "E_MISSING_TOKEN";
    pub const TOKEN_REQUIRED: &str = "E_TOKEN_REQUIRED";
    pub const BAD_TOKEN: &str = "E_BAD_TOKEN";
    pub const MISSING_SECRET: &str = "E_MISSING_SECRET";
    pub const ALREADY_REGISTERED: &str = "E_ALREADY_REGISTERED";
    pub const CLOCK_SKEW: &str = "E_CLOCK_SKEW";
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no device token stored; activate this machine first")]
    MissingToken,
    #[error("relay requires a device token for this operation")]
    TokenRequired,
    #[error("relay rejected the device token")]
    BadToken,
    #[error("no signing secret stored for this relay environment")]
    MissingSecret,
    #[error("request timestamp outside the relay's accepted window")]
    ClockSkew { server_time: Option<i64> },
    #[error("session id already pending on the relay")]
    SidTaken,
    #[error("relay rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("relay temporarily unavailable")]
    Unavailable { retry_after: Option<Duration> },
    #[error("relay returned http {status}")]
    Http {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("invalid relay response: {0}")]
    InvalidResponse(String),
    #[error("invalid relay request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Secrets(#[from] SecretError),
}

impl RelayError {
    /// Credential problems. Retrying cannot fix these; the operator has to
    /// re-activate the license or provision the signing secret.
    pub fn is_identity(&self) -> bool {
        matches!(
            self,
            RelayError::MissingToken
                | RelayError::TokenRequired
                | RelayError::BadToken
                | RelayError::MissingSecret
                | RelayError::Secrets(_)
        )
    }

    /// Errors where resending the identical request cannot change the
    /// outcome, so backoff loops stop immediately.
    pub fn is_fatal(&self) -> bool {
        self.is_identity()
            || matches!(
                self,
                RelayError::SidTaken
                    | RelayError::ClockSkew { .. }
                    | RelayError::InvalidRequest(_)
            )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::RateLimited { retry_after } | RelayError::Unavailable { retry_after } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// The wire code for this error, where one exists.
    pub fn code(&self) -> Option<&str> {
        match self {
            RelayError::MissingToken => Some(codes::MISSING_TOKEN),
            RelayError::TokenRequired => Some(codes::TOKEN_REQUIRED),
            RelayError::BadToken => Some(codes::BAD_TOKEN),
            RelayError::MissingSecret => Some(codes::MISSING_SECRET),
            RelayError::ClockSkew { .. } => Some(codes::CLOCK_SKEW),
            RelayError::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
