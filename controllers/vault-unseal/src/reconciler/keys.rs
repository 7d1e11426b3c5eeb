//! Key material loading.
//!
//! Resolves the secret references of a policy into distinct key shares and
//! checks the count against the threshold. Share values are never logged,
//! never persisted, and wiped from memory when the cycle drops them.

use crate::error::ControllerError;
use crate::reconciler::capabilities::SecretSource;
use crate::reconciler::policy::UnsealPolicy;
use crds::SecretKeyReference;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Default data key of a CA bundle Secret
pub const DEFAULT_CA_KEY: &str = "ca.crt";

/// One unseal key share and the reference it was read from
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    value: String,
    #[zeroize(skip)]
    source: SecretKeyReference,
}

impl KeyShare {
    pub fn new(value: impl Into<String>, source: SecretKeyReference) -> Self {
        Self {
            value: value.into(),
            source,
        }
    }

    /// The share itself, for submission to Vault only
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> &SecretKeyReference {
        &self.source
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Distinct key shares loaded for one cycle
#[derive(Debug)]
pub struct KeyMaterial {
    shares: Vec<KeyShare>,
    /// Threshold the loaded set was validated against
    threshold: u32,
}

impl KeyMaterial {
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Shares contributed by each source, in source order
    pub fn by_source(&self) -> BTreeMap<&SecretKeyReference, Vec<&KeyShare>> {
        let mut map: BTreeMap<&SecretKeyReference, Vec<&KeyShare>> = BTreeMap::new();
        for share in &self.shares {
            map.entry(share.source()).or_default().push(share);
        }
        map
    }

    pub fn into_shares(self) -> Vec<KeyShare> {
        self.shares
    }
}

/// Load and validate the key shares of a policy.
///
/// Fails with `KeyMaterial` when a Secret or key is missing, a value is not
/// UTF-8, a source yields no share, or fewer distinct shares than the
/// threshold were found. Identical values from different sources count once.
pub async fn load_key_material(
    secrets: &dyn SecretSource,
    policy: &UnsealPolicy,
) -> Result<KeyMaterial, ControllerError> {
    let mut shares: Vec<KeyShare> = Vec::new();

    for source in &policy.key_sources {
        let namespace = source.namespace_or(&policy.namespace);
        let data = secrets
            .get_secret_data(namespace, &source.name)
            .await
            .map_err(|e| {
                ControllerError::KeyMaterial(format!("failed to read secret {}: {}", source, e))
            })?
            .ok_or_else(|| {
                ControllerError::KeyMaterial(format!(
                    "secret {}/{} not found",
                    namespace, source.name
                ))
            })?;

        let candidates = shares_from_secret(source, data)?;
        if candidates.is_empty() {
            return Err(ControllerError::KeyMaterial(format!(
                "secret {} contains no key shares",
                source
            )));
        }

        let mut added = 0usize;
        for candidate in candidates.iter() {
            if shares.iter().any(|s| s.expose() == candidate.as_str()) {
                continue;
            }
            shares.push(KeyShare::new(candidate.as_str(), source.clone()));
            added += 1;
        }
        debug!(
            "Loaded {} share(s) from {} ({} duplicate)",
            added,
            source,
            candidates.len() - added
        );
    }

    let distinct = share_count(shares.len());
    let threshold = policy.threshold.unwrap_or(distinct);
    if distinct < threshold {
        return Err(ControllerError::KeyMaterial(format!(
            "found {} distinct key share(s), threshold is {}",
            distinct, threshold
        )));
    }

    Ok(KeyMaterial { shares, threshold })
}

/// Share count, saturating at `u32::MAX`
fn share_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Candidate share values of one Secret, in key order
fn shares_from_secret(
    source: &SecretKeyReference,
    mut data: BTreeMap<String, Vec<u8>>,
) -> Result<Vec<Zeroizing<String>>, ControllerError> {
    let mut out = Vec::new();

    match &source.key {
        Some(key) => {
            let raw = data
                .remove(key.as_str())
                .map(Zeroizing::new)
                .ok_or_else(|| {
                    ControllerError::KeyMaterial(format!("key '{}' missing in secret {}", key, source))
                })?;
            let text = decode_utf8(source, key, &raw)?;
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                out.push(Zeroizing::new(line.to_string()));
            }
        }
        None => {
            for (key, value) in data {
                let raw = Zeroizing::new(value);
                let text = decode_utf8(source, &key, &raw)?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    out.push(Zeroizing::new(trimmed.to_string()));
                }
            }
        }
    }

    Ok(out)
}

fn decode_utf8<'a>(
    source: &SecretKeyReference,
    key: &str,
    raw: &'a [u8],
) -> Result<&'a str, ControllerError> {
    std::str::from_utf8(raw).map_err(|_| {
        ControllerError::KeyMaterial(format!(
            "key '{}' in secret {} is not valid UTF-8",
            key, source
        ))
    })
}

/// Load the PEM CA bundle referenced by the TLS settings, if any
pub async fn load_ca_bundle(
    secrets: &dyn SecretSource,
    policy: &UnsealPolicy,
) -> Result<Option<Vec<u8>>, ControllerError> {
    let Some(reference) = &policy.tls.ca_bundle else {
        return Ok(None);
    };

    let namespace = reference.namespace_or(&policy.namespace);
    let key = reference.key.as_deref().unwrap_or(DEFAULT_CA_KEY);
    let mut data = secrets
        .get_secret_data(namespace, &reference.name)
        .await
        .map_err(|e| ControllerError::Tls(format!("failed to read CA secret {}: {}", reference, e)))?
        .ok_or_else(|| {
            ControllerError::Tls(format!("CA secret {}/{} not found", namespace, reference.name))
        })?;

    let pem = data.remove(key).ok_or_else(|| {
        ControllerError::Tls(format!("key '{}' missing in CA secret {}", key, reference))
    })?;
    if pem.is_empty() {
        return Err(ControllerError::Tls(format!("CA bundle in {} is empty", reference)));
    }
    Ok(Some(pem))
}
