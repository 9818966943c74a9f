//! Order and refund persistence
//!
//! [`order_repository::OrderStore`] is the only way order rows change. The
//! Postgres implementation is the production store; the in-memory one backs
//! tests and single-process deployments.

pub mod error;
pub mod memory;
pub mod models;
pub mod order_repository;
#[cfg(feature = "database")]
pub mod postgres;

pub use error::StoreError;
pub use memory::InMemoryOrderStore;
pub use models::{
    NewOrder, NewRefund, Order, OrderStatus, OrderUpdate, Refund, RefundCreation,
    RefundSettlement, RefundStatus, RefundUpdate,
};
pub use order_repository::OrderStore;
#[cfg(feature = "database")]
pub use postgres::PgOrderStore;
