//! Payment aggregation gateway: notification ingestion and reconciliation
//!
//! Provider webhooks are verified by per-provider adapters, deduplicated with
//! a short-lived distributed lock and applied to orders exactly once by the
//! transition engine. A leader-elected reconciliation sweep re-queries
//! providers for orders whose notification never arrived.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
