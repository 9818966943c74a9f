//! Errors raised at the provider adapter boundary

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Tampered, replayed or unsigned delivery
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Authentic delivery that carries nothing to apply (non-terminal status, unhandled event type)
    #[error("ignored event: {0}")]
    IgnoredEvent(String),

    /// Transient provider-side or network failure
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("order not found at provider: {0}")]
    NotFound(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::ProviderUnavailable(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::MalformedPayload(format!("undecodable provider response: {}", e))
        } else {
            ProviderError::ProviderUnavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::MalformedPayload(e.to_string())
    }
}
