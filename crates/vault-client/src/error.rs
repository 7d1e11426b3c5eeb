//! Vault client errors

use thiserror::Error;

/// Errors that can occur when talking to the Vault seal API
#[derive(Debug, Error)]
pub enum VaultError {
    /// Network, TLS handshake, or timeout failure. The endpoint could not answer.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Vault answered but the response could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Vault refused the submitted key share
    #[error("Key share rejected: {0}")]
    RejectedShare(String),

    /// CA bundle or TLS settings are unusable
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VaultError {
    /// Classify a `reqwest` failure raised while sending a request.
    ///
    /// Everything that happens before a response arrives is a connection error;
    /// failures reading or decoding a body are protocol errors.
    pub fn from_send(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_body() {
            VaultError::Protocol(err.to_string())
        } else {
            VaultError::Connection(err.to_string())
        }
    }

    /// Whether the endpoint could not be reached at all
    pub fn is_connection(&self) -> bool {
        matches!(self, VaultError::Connection(_))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::Connection(_) => "connection",
            VaultError::Protocol(_) => "protocol",
            VaultError::RejectedShare(_) => "rejected_share",
            VaultError::Tls(_) => "tls",
            VaultError::Http(_) => "http",
        }
    }
}
