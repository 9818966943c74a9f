//! Middleware modules for the payment gateway
//!
//! Provides request/response logging and timing wrappers

pub mod logging;
