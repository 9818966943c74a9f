//! Pluggable signing capability
//!
//! Adapters decide *what* bytes get signed (canonical strings, envelopes,
//! header tuples); a [`SignatureScheme`] decides *how*. Deployments whose
//! providers require RSA plug in their own scheme; the gateway ships HMAC-SHA256.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;

use super::error::ProviderError;

pub trait SignatureScheme: Send + Sync {
    /// Value reported to providers in `sign_type`-style fields
    fn name(&self) -> &'static str;

    fn sign(&self, message: &[u8]) -> Result<String, ProviderError>;

    fn verify(&self, message: &[u8], signature: &str) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

#[derive(Clone)]
pub struct HmacSha256Scheme {
    key: Vec<u8>,
    encoding: SignatureEncoding,
}

impl fmt::Debug for HmacSha256Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSha256Scheme")
            .field("key", &"[REDACTED]")
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl HmacSha256Scheme {
    pub fn new(key: impl Into<Vec<u8>>, encoding: SignatureEncoding) -> Self {
        Self {
            key: key.into(),
            encoding,
        }
    }

    fn mac(&self) -> Result<Hmac<Sha256>, ProviderError> {
        Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|_| ProviderError::Configuration("invalid HMAC key".to_string()))
    }
}

impl SignatureScheme for HmacSha256Scheme {
    fn name(&self) -> &'static str {
        "HMAC-SHA256"
    }

    fn sign(&self, message: &[u8]) -> Result<String, ProviderError> {
        let mut mac = self.mac()?;
        mac.update(message);
        let digest = mac.finalize().into_bytes();
        Ok(match self.encoding {
            SignatureEncoding::Hex => hex::encode(digest),
            SignatureEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(digest),
        })
    }

    fn verify(&self, message: &[u8], signature: &str) -> Result<(), ProviderError> {
        let signature = signature.trim();
        if signature.is_empty() {
            return Err(ProviderError::InvalidSignature("empty signature".to_string()));
        }

        let raw = match self.encoding {
            SignatureEncoding::Hex => hex::decode(signature.to_ascii_lowercase())
                .map_err(|_| ProviderError::InvalidSignature("signature is not hex".to_string()))?,
            SignatureEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(signature)
                .map_err(|_| ProviderError::InvalidSignature("signature is not base64".to_string()))?,
        };

        let mut mac = self.mac()?;
        mac.update(message);
        // constant-time comparison
        mac.verify_slice(&raw)
            .map_err(|_| ProviderError::InvalidSignature("signature mismatch".to_string()))
    }
}

/// `k1=v1&k2=v2` over sorted keys, skipping empty values and excluded keys.
pub fn canonical_query(params: &BTreeMap<String, String>, exclude: &[&str]) -> String {
    params
        .iter()
        .filter(|(k, v)| !v.is_empty() && !exclude.contains(&k.as_str()))
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
