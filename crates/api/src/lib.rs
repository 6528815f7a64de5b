//! HTTP surface for the payment-recovery engine.

pub mod app;
pub mod telemetry;
