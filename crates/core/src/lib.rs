//! `dunning-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use entity::Entity;
pub use error::{DunningError, DunningResult};
pub use id::{CsmId, InvoiceId, OrganizationId, SequenceId, SubscriptionId};
pub use money::{Currency, Money};
pub use value_object::ValueObject;
