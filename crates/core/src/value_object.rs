//! Value object trait: equality by value, not identity.

/// Marker trait for immutable domain values compared by their attributes
/// rather than an identity (e.g. `Money`). To "modify" one, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
