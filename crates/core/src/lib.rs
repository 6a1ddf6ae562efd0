//! `chalak-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the `Money` value object and the shared error model.

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{InstituteId, InvoiceId, InvoiceItemId, PaymentId, StudentId, UserId};
pub use money::{MONEY_MAX_CENTS, MONEY_SCALE, Money};
pub use value_object::ValueObject;
