//! Infrastructure layer: storage, configuration and the billing use cases.

pub mod config;
pub mod service;
pub mod store;

pub use config::{BillingConfig, ConfigError, DatabaseConfig};
pub use service::{BillingError, BillingService, ErrorKind};
pub use store::{BillingStore, BillingTx, InMemoryBillingStore, PostgresBillingStore, StoreError};
