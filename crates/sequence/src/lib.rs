//! `dunning-sequence` — the payment-recovery domain.
//!
//! One [`DunningSequence`] tracks a single failed recurring payment through a
//! bounded series of retries, escalations, and manual interventions until it
//! is recovered, cancelled, or exhausted. The [`RetryPolicy`] is the pure
//! scheduling function that maps attempt numbers to retry instants.

pub mod policy;
pub mod sequence;

pub use policy::RetryPolicy;
pub use sequence::{
    AttemptOutcome, AttemptRecord, DunningSequence, DunningStatus, Note, RetryDisposition,
};
