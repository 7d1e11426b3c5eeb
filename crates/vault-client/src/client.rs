//! Vault API client
//!
//! Implements the two calls needed to unseal a node:
//! `GET /v1/sys/seal-status` and `PUT /v1/sys/unseal`.
//! Each call is bounded by the client timeout and is never retried here.

use crate::error::VaultError;
use crate::models::{ErrorResponse, SealStatus, UnsealRequest};
use crate::vault_trait::VaultClientTrait;
use reqwest::{Certificate, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Connection settings shared by every node of one Vault deployment
#[derive(Clone)]
pub struct VaultClientConfig {
    /// "http" or "https"
    pub scheme: String,
    /// API port on every node
    pub port: u16,
    /// Per-request timeout
    pub timeout: Duration,
    /// PEM CA bundle added to the trust store
    pub ca_pem: Option<Vec<u8>>,
    /// Skip certificate and hostname verification
    pub skip_verify: bool,
}

impl std::fmt::Debug for VaultClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClientConfig")
            .field("scheme", &self.scheme)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("ca_pem", &self.ca_pem.as_ref().map(|pem| pem.len()))
            .field("skip_verify", &self.skip_verify)
            .finish()
    }
}

impl Default for VaultClientConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 8200,
            timeout: Duration::from_secs(5),
            ca_pem: None,
            skip_verify: false,
        }
    }
}

/// Vault seal API client
pub struct VaultClient {
    client: Client,
    scheme: String,
    port: u16,
}

impl VaultClient {
    /// Create a new Vault client
    ///
    /// # Arguments
    /// * `config` - Scheme, port, timeout and TLS trust settings
    pub fn new(config: VaultClientConfig) -> Result<Self, VaultError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout);

        if let Some(pem) = &config.ca_pem {
            let certs = Certificate::from_pem_bundle(pem)
                .map_err(|e| VaultError::Tls(format!("Invalid CA bundle: {}", e)))?;
            if certs.is_empty() {
                return Err(VaultError::Tls("CA bundle contains no certificates".to_string()));
            }
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if config.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(VaultError::Http)?;

        Ok(Self {
            client,
            scheme: config.scheme,
            port: config.port,
        })
    }

    /// Build the base URL for a node
    ///
    /// IPv6 literals are wrapped in brackets.
    pub fn base_url(&self, address: &str) -> String {
        if address.contains(':') && !address.starts_with('[') {
            format!("{}://[{}]:{}", self.scheme, address, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, address, self.port)
        }
    }

    /// Read the body of an unsuccessful response as a Vault error message
    async fn error_message(response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) if !parsed.errors.is_empty() => format!("{} - {}", status, parsed.errors.join("; ")),
            _ => format!("{} - {}", status, body.chars().take(200).collect::<String>()),
        }
    }

    /// Decode a seal status body, keeping the start of the body for diagnostics
    async fn decode_status(response: reqwest::Response) -> Result<SealStatus, VaultError> {
        let text = response.text().await.map_err(VaultError::from_send)?;
        serde_json::from_str(&text).map_err(|e| {
            VaultError::Protocol(format!(
                "error decoding seal status: {} - Response (first 200 chars): {}",
                e,
                text.chars().take(200).collect::<String>()
            ))
        })
    }
}

#[async_trait::async_trait]
impl VaultClientTrait for VaultClient {
    async fn seal_status(&self, address: &str) -> Result<SealStatus, VaultError> {
        let url = format!("{}/v1/sys/seal-status", self.base_url(address));
        debug!("GET {}", url);

        let response = self.client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(VaultError::from_send)?;

        if !response.status().is_success() {
            let message = Self::error_message(response).await;
            return Err(VaultError::Protocol(format!("GET {} failed: {}", url, message)));
        }

        Self::decode_status(response).await
    }

    async fn submit_key_share(&self, address: &str, share: &str) -> Result<SealStatus, VaultError> {
        let url = format!("{}/v1/sys/unseal", self.base_url(address));
        debug!("PUT {}", url);

        let response = self.client
            .put(&url)
            .header("Accept", "application/json")
            .json(&UnsealRequest { key: share })
            .send()
            .await
            .map_err(VaultError::from_send)?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let message = Self::error_message(response).await;
            return Err(VaultError::RejectedShare(message));
        }

        if !status.is_success() {
            let message = Self::error_message(response).await;
            return Err(VaultError::Protocol(format!("PUT {} failed: {}", url, message)));
        }

        Self::decode_status(response).await
    }
}
