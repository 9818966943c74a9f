//! Provider adapter capability

use async_trait::async_trait;

use super::error::ProviderError;
use super::types::{AckOutcome, ProviderAck, ProviderName, RawCallback, RemoteStatus, VerifiedEvent};

/// One implementation per provider. This is the only place where transport
/// (form POST, encrypted JSON envelope, XML) and status vocabulary differ.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    fn app_id(&self) -> &str;

    /// Authenticates and normalizes an inbound callback.
    ///
    /// Pure with respect to stored state, so a delivery can be re-verified
    /// any number of times.
    fn verify(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError>;

    /// Actively polls the provider for an order's status. Used by reconciliation only.
    async fn query(&self, order_ref: &str) -> Result<RemoteStatus, ProviderError>;

    /// Builds the acknowledgement body/status the provider expects for `callback`.
    fn acknowledge(&self, callback: &RawCallback, outcome: &AckOutcome) -> ProviderAck;
}
