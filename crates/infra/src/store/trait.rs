use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use chalak_billing::{Invoice, InvoiceFilter, InvoicePage, Payment};
use chalak_core::{DomainError, InvoiceId, PaymentId};

/// Storage operation error.
///
/// These are **infrastructure errors** (connectivity, constraints, unreadable
/// rows) as opposed to domain errors (validation, state conflicts).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (duplicate id or invoice number).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referential or check constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A stored row could not be turned back into a domain value.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Corrupt(value.to_string())
    }
}

/// Billing persistence boundary.
///
/// Reads outside a transaction never lock and never see soft-deleted rows.
/// Every write that must stay consistent with an invoice's balance goes
/// through a [`BillingTx`].
#[async_trait]
pub trait BillingStore: Send + Sync {
    type Tx: BillingTx;

    /// Open a unit of work.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn find_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError>;

    async fn find_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>, StoreError>;

    /// Newest first, paged according to the filter.
    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<InvoicePage, StoreError>;

    async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError>;

    /// Payments of one invoice, most recent `payment_date` first.
    async fn payments_for_invoice(&self, invoice_id: InvoiceId)
    -> Result<Vec<Payment>, StoreError>;

    /// Mark an invoice (and its items) deleted. Returns `false` when there was
    /// no live invoice with that id.
    async fn soft_delete_invoice(
        &self,
        id: InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Unit of work over the billing tables.
///
/// Nothing written through a transaction is visible to other readers until
/// [`BillingTx::commit`] succeeds. Dropping a transaction without committing
/// discards its writes.
#[async_trait]
pub trait BillingTx: Send {
    /// Load a live invoice and hold it exclusively until the transaction ends.
    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError>;

    /// Insert a new invoice together with its line items.
    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError>;

    /// Persist `paid_amount`, `status`, `paid_at` and `updated_at`.
    async fn save_invoice_state(&mut self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> BillingStore for Arc<S>
where
    S: BillingStore + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }

    async fn find_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        (**self).find_invoice(id).await
    }

    async fn find_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>, StoreError> {
        (**self).find_invoice_by_number(number).await
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<InvoicePage, StoreError> {
        (**self).list_invoices(filter).await
    }

    async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        (**self).find_payment(id).await
    }

    async fn payments_for_invoice(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Vec<Payment>, StoreError> {
        (**self).payments_for_invoice(invoice_id).await
    }

    async fn soft_delete_invoice(
        &self,
        id: InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).soft_delete_invoice(id, at).await
    }
}
