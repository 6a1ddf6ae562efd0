use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use chalak_billing::{Invoice, InvoiceFilter, InvoicePage, Payment};
use chalak_core::{Entity, InvoiceId, PaymentId};

use super::r#trait::{BillingStore, BillingTx, StoreError};

#[derive(Debug)]
struct Row<E> {
    value: E,
    deleted_at: Option<DateTime<Utc>>,
}

/// Rows keyed by entity id, soft-deleted rows included.
#[derive(Debug)]
struct Table<E: Entity> {
    rows: HashMap<E::Id, Row<E>>,
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<E: Entity> Table<E> {
    fn live(&self, id: E::Id) -> Option<&E> {
        self.rows
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .map(|r| &r.value)
    }

    fn live_mut(&mut self, id: E::Id) -> Option<&mut E> {
        self.rows
            .get_mut(&id)
            .filter(|r| r.deleted_at.is_none())
            .map(|r| &mut r.value)
    }

    fn iter_live(&self) -> impl Iterator<Item = &E> {
        self.rows
            .values()
            .filter(|r| r.deleted_at.is_none())
            .map(|r| &r.value)
    }

    /// Returns `false` if a row with the same id already exists.
    fn insert(&mut self, value: E) -> bool {
        let id = value.id();
        if self.rows.contains_key(&id) {
            return false;
        }
        self.rows.insert(
            id,
            Row {
                value,
                deleted_at: None,
            },
        );
        true
    }

    fn soft_delete(&mut self, id: E::Id, at: DateTime<Utc>) -> bool {
        match self.rows.get_mut(&id) {
            Some(row) if row.deleted_at.is_none() => {
                row.deleted_at = Some(at);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    invoices: Table<Invoice>,
    payments: Table<Payment>,
}

impl State {
    fn number_taken(&self, number: &str) -> bool {
        self.invoices
            .rows
            .values()
            .any(|r| r.value.invoice_number() == number)
    }
}

/// In-memory billing store.
///
/// Intended for tests/dev. A transaction holds the store's lock for its whole
/// lifetime, so writers are fully serialized; reads wait for open
/// transactions to finish.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBillingStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Transaction over [`InMemoryBillingStore`].
///
/// Holds the store lock for its whole lifetime. Writes are staged here and
/// applied to the shared state only by `commit`.
#[derive(Debug)]
pub struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    invoices: HashMap<InvoiceId, Invoice>,
    payments: Vec<Payment>,
}

impl InMemoryTx {
    fn live_invoice(&self, id: InvoiceId) -> Option<&Invoice> {
        self.invoices
            .get(&id)
            .or_else(|| self.guard.invoices.live(id))
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(InMemoryTx {
            guard,
            invoices: HashMap::new(),
            payments: Vec::new(),
        })
    }

    async fn find_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.invoices.live(id).cloned())
    }

    async fn find_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .iter_live()
            .find(|i| i.invoice_number() == number)
            .cloned())
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<InvoicePage, StoreError> {
        let state = self.state.lock().await;

        let mut matching: Vec<&Invoice> = state
            .invoices
            .iter_live()
            .filter(|i| filter.matches(i))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().as_uuid().cmp(a.id().as_uuid()))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .cloned()
            .collect();

        Ok(InvoicePage { items, total })
    }

    async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.payments.live(id).cloned())
    }

    async fn payments_for_invoice(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Vec<Payment>, StoreError> {
        let state = self.state.lock().await;

        let mut payments: Vec<Payment> = state
            .payments
            .iter_live()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| {
            b.payment_date
                .cmp(&a.payment_date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        Ok(payments)
    }

    async fn soft_delete_invoice(
        &self,
        id: InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.invoices.soft_delete(id, at))
    }
}

#[async_trait]
impl BillingTx for InMemoryTx {
    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self.live_invoice(id).cloned())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), StoreError> {
        let id = invoice.id();
        let number = invoice.invoice_number();

        if self.guard.invoices.rows.contains_key(&id) || self.invoices.contains_key(&id) {
            return Err(StoreError::Conflict(format!("invoice {id} already exists")));
        }
        if self.guard.number_taken(number)
            || self.invoices.values().any(|i| i.invoice_number() == number)
        {
            return Err(StoreError::Conflict(format!(
                "invoice number {number} already exists"
            )));
        }

        self.invoices.insert(id, invoice.clone());
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        if self.live_invoice(payment.invoice_id).is_none() {
            return Err(StoreError::Constraint(format!(
                "payment {} references unknown invoice {}",
                payment.id, payment.invoice_id
            )));
        }
        if self.guard.payments.rows.contains_key(&payment.id)
            || self.payments.iter().any(|p| p.id == payment.id)
        {
            return Err(StoreError::Conflict(format!(
                "payment {} already exists",
                payment.id
            )));
        }

        self.payments.push(payment.clone());
        Ok(())
    }

    async fn save_invoice_state(&mut self, invoice: &Invoice) -> Result<(), StoreError> {
        let id = invoice.id();
        let mut record = self
            .live_invoice(id)
            .ok_or_else(|| StoreError::Constraint(format!("no live invoice {id} to update")))?
            .record()
            .clone();

        record.paid_amount = invoice.paid_amount();
        record.status = invoice.status();
        record.paid_at = invoice.paid_at();
        record.updated_at = invoice.updated_at();

        self.invoices.insert(id, Invoice::from_record(record)?);
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let InMemoryTx {
            mut guard,
            invoices,
            payments,
        } = self;

        for (id, invoice) in invoices {
            match guard.invoices.live_mut(id) {
                Some(slot) => *slot = invoice,
                None => {
                    guard.invoices.insert(invoice);
                }
            }
        }
        for payment in payments {
            guard.payments.insert(payment);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
