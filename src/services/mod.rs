//! Services module for settlement logic and downstream integrations

pub mod notifier;
pub mod orders;
pub mod pipeline;
pub mod transition;

pub use notifier::{
    DownstreamNotifier, NotificationPayload, NotificationSink, NotifierConfig, NotifierMetrics,
    NotifyError, NotifyOutcome,
};
pub use orders::{OrderService, OrderView, PlaceOrderRequest, RefundRequest};
pub use pipeline::NotificationPipeline;
pub use transition::{Transition, TransitionConfig, TransitionEngine, TransitionError};
