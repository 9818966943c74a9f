//! Payment provider integrations
//!
//! Every provider-specific format lives behind [`provider::PaymentProvider`];
//! the rest of the gateway only sees [`types::VerifiedEvent`] and
//! [`types::RemoteStatus`].

pub mod error;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod signature;
pub mod types;

pub use error::ProviderError;
pub use provider::PaymentProvider;
pub use registry::ProviderRegistry;
pub use types::{
    AckOutcome, EventKind, EventOutcome, ProviderAck, ProviderCredentials, ProviderName,
    RawCallback, RefundOutcome, RemoteStatus, VerifiedEvent,
};
