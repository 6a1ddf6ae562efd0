//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Invoices and payments are entities: two records with the same figures are
/// still different records if their identifiers differ.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}
