//! The two error kinds that cross pipeline boundaries.

use serde::Serialize;
use thiserror::Error;

/// Errors produced by pipeline stages and plugins.
///
/// An [`Abort`](GatewayError::Abort) deliberately denies a request: the client
/// receives the chosen status and message verbatim as a JSON envelope. Any
/// other failure is [`Internal`](GatewayError::Internal): the client gets a
/// generic 500 envelope, the underlying message is never leaked, and an alert
/// mail goes out subject to the cooldown.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    Abort { status: u16, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Denies the request with the given status and user-safe message.
    /// A status of 0 falls back to 400.
    pub fn abort(status: u16, message: impl Into<String>) -> Self {
        Self::Abort { status, message: message.into() }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            Self::Abort { status: 0, .. } => 400,
            Self::Abort { status, .. } => *status,
            Self::Internal(_) => 500,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort { .. })
    }
}

impl From<crate::store::StoreError> for GatewayError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

/// The JSON error body every denied or failed request receives.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}
