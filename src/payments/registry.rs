//! Provider registry owned by the service context
//!
//! Holds one adapter (and its HTTP client / keys) per `(provider, app_id)`.
//! Credential rotation replaces or invalidates entries explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::error::ProviderError;
use super::provider::PaymentProvider;
use super::providers::build_provider;
use super::types::{ProviderCredentials, ProviderName};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub provider: ProviderName,
    pub app_id: String,
}

impl ProviderKey {
    pub fn new(provider: ProviderName, app_id: impl Into<String>) -> Self {
        Self {
            provider,
            app_id: app_id.into(),
        }
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderKey, Arc<dyn PaymentProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds adapters for every credential set. Any invalid set is fatal.
    pub async fn from_credentials(
        credentials: &[ProviderCredentials],
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let registry = Self::new();
        for creds in credentials {
            creds.validate()?;
            let provider = build_provider(creds.clone(), http.clone())?;
            registry.register(provider).await;
        }
        Ok(registry)
    }

    /// Adds or replaces the adapter for its `(provider, app_id)`.
    pub async fn register(&self, provider: Arc<dyn PaymentProvider>) {
        let key = ProviderKey::new(provider.name(), provider.app_id());
        info!(provider = %key.provider, app_id = %key.app_id, "Registered payment provider");
        self.providers.write().await.insert(key, provider);
    }

    /// Rebuilds an adapter from rotated credentials.
    pub async fn rotate(
        &self,
        credentials: ProviderCredentials,
        http: reqwest::Client,
    ) -> Result<(), ProviderError> {
        credentials.validate()?;
        let provider = build_provider(credentials, http)?;
        self.register(provider).await;
        Ok(())
    }

    pub async fn invalidate(&self, provider: ProviderName, app_id: &str) -> bool {
        let removed = self
            .providers
            .write()
            .await
            .remove(&ProviderKey::new(provider, app_id))
            .is_some();
        if removed {
            info!(provider = %provider, app_id = %app_id, "Invalidated payment provider");
        }
        removed
    }

    pub async fn get(
        &self,
        provider: ProviderName,
        app_id: &str,
    ) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
        self.providers
            .read()
            .await
            .get(&ProviderKey::new(provider, app_id))
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(format!("{}/{}", provider, app_id)))
    }

    /// App id used when an order names only its provider. Lowest app id wins
    /// so the choice is stable across restarts.
    pub async fn default_app_id(&self, provider: ProviderName) -> Option<String> {
        self.providers
            .read()
            .await
            .keys()
            .filter(|key| key.provider == provider)
            .map(|key| key.app_id.clone())
            .min()
    }

    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alipay_credentials(app_id: &str) -> ProviderCredentials {
        ProviderCredentials {
            provider: ProviderName::Alipay,
            app_id: app_id.to_string(),
            merchant_id: None,
            base_url: "http://127.0.0.1:9/gateway.do".to_string(),
            signing_secret: "secret".to_string(),
            notify_token: None,
            api_v3_key: None,
            query_timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_register_get_and_invalidate() {
        let registry = ProviderRegistry::from_credentials(
            &[alipay_credentials("app-b"), alipay_credentials("app-a")],
            reqwest::Client::new(),
        )
        .await
        .unwrap();

        assert_eq!(registry.len().await, 2);
        assert!(registry.get(ProviderName::Alipay, "app-a").await.is_ok());
        assert_eq!(
            registry.default_app_id(ProviderName::Alipay).await.as_deref(),
            Some("app-a")
        );

        assert!(registry.invalidate(ProviderName::Alipay, "app-a").await);
        assert!(!registry.invalidate(ProviderName::Alipay, "app-a").await);
        assert!(matches!(
            registry.get(ProviderName::Alipay, "app-a").await,
            Err(ProviderError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_credentials_are_fatal() {
        let mut creds = alipay_credentials("app-a");
        creds.signing_secret.clear();
        let result = ProviderRegistry::from_credentials(&[creds], reqwest::Client::new()).await;
        assert!(matches!(result, Err(ProviderError::Configuration(_))));
    }
}
