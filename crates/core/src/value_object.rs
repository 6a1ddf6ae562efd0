//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have **no identity**: two instances holding the same values
/// are interchangeable (`Money` is the canonical example in this workspace).
/// They are immutable; "changing" one means constructing a new value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
