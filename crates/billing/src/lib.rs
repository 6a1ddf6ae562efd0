//! Billing domain module.
//!
//! Business rules for student invoices and the payments that settle them,
//! implemented purely as deterministic domain logic (no IO, no HTTP, no storage).

pub mod invoice;
pub mod payment;
pub mod query;
pub mod reconcile;

pub use invoice::{
    Invoice, InvoiceItem, InvoiceRecord, InvoiceStatus, IssueInvoice, NewInvoiceItem,
};
pub use payment::{AddPayment, Payment, PaymentMethod};
pub use query::{InvoiceFilter, InvoicePage};
pub use reconcile::reconcile;
