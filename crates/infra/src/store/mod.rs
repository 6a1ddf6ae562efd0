//! Billing persistence boundary.
//!
//! The service layer talks to [`BillingStore`] / [`BillingTx`] only; the
//! in-memory store backs tests and local runs, the Postgres store backs
//! everything else.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryBillingStore, InMemoryTx};
pub use postgres::{PostgresBillingStore, PostgresTx};
pub use r#trait::{BillingStore, BillingTx, StoreError};
