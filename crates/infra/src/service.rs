//! Billing use cases (application-level orchestration).
//!
//! Every state change follows the same pipeline:
//!
//! ```text
//! Command
//!   ↓
//! 1. Begin a store transaction
//!   ↓
//! 2. Lock the invoice row (or build a new invoice)
//!   ↓
//! 3. Decide in the domain (pure; mutates only the in-memory invoice)
//!   ↓
//! 4. Write payment row + invoice state
//!   ↓
//! 5. Commit (any earlier failure rolls everything back)
//! ```
//!
//! This module contains no IO itself; it composes the [`BillingStore`] trait.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{Span, info, instrument, warn};

use chalak_billing::{AddPayment, Invoice, InvoiceFilter, InvoicePage, IssueInvoice, Payment};
use chalak_core::{DomainError, Entity, InvoiceId, PaymentId};

use crate::store::{BillingStore, BillingTx, StoreError};

/// Coarse error class exposed to callers (maps 1:1 onto HTTP-style status
/// families: 404 / 400 / 409 / 500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Conflict,
    Internal,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::Domain(DomainError::NotFound(_)) => ErrorKind::NotFound,
            BillingError::Domain(DomainError::BadRequest(_) | DomainError::InvalidId(_)) => {
                ErrorKind::BadRequest
            }
            BillingError::Domain(DomainError::Conflict(_)) => ErrorKind::Conflict,
            BillingError::Domain(DomainError::InvariantViolation(_)) => ErrorKind::Internal,
            BillingError::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            BillingError::Store(_) => ErrorKind::Internal,
        }
    }
}

fn invoice_not_found(id: InvoiceId) -> BillingError {
    DomainError::not_found(format!("invoice {id} not found")).into()
}

/// Roll back after a rejected decision, keeping the original error.
async fn abort<T: BillingTx>(tx: T, err: BillingError) -> BillingError {
    if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "rollback failed");
    }
    err
}

/// Invoice and payment use cases over a [`BillingStore`].
///
/// Clone-cheap when the store is (`Arc<_>`, pooled Postgres store).
#[derive(Debug, Clone)]
pub struct BillingService<S> {
    store: S,
    tax_rate: Decimal,
}

impl<S> BillingService<S> {
    /// Service with a zero tax rate.
    pub fn new(store: S) -> Self {
        Self {
            store,
            tax_rate: Decimal::ZERO,
        }
    }

    pub fn with_tax_rate(mut self, tax_rate: Decimal) -> Self {
        self.tax_rate = tax_rate;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> BillingService<S>
where
    S: BillingStore,
{
    /// Price and persist a new invoice with its line items.
    #[instrument(
        skip(self, cmd),
        fields(
            invoice_id = %cmd.invoice_id,
            student_id = %cmd.student_id,
            items = cmd.items.len(),
            invoice_number = tracing::field::Empty
        ),
        err
    )]
    pub async fn issue_invoice(&self, cmd: IssueInvoice) -> Result<Invoice, BillingError> {
        let invoice = Invoice::issue(&cmd, self.tax_rate)?;
        Span::current().record("invoice_number", invoice.invoice_number());

        let mut tx = self.store.begin().await?;
        tx.insert_invoice(&invoice).await?;
        tx.commit().await?;

        info!(total = %invoice.total_amount(), "invoice issued");
        Ok(invoice)
    }

    /// Accept a payment and reconcile the invoice, atomically.
    ///
    /// The invoice row stays locked from the balance check until commit, so
    /// concurrent payments against one invoice cannot both spend the same
    /// remaining balance.
    #[instrument(
        skip(self, cmd),
        fields(
            invoice_id = %cmd.invoice_id,
            amount = %cmd.amount,
            method = %cmd.method,
            payment_id = tracing::field::Empty
        ),
        err
    )]
    pub async fn add_payment(&self, cmd: AddPayment) -> Result<Payment, BillingError> {
        let mut tx = self.store.begin().await?;

        let Some(mut invoice) = tx.lock_invoice(cmd.invoice_id).await? else {
            return Err(abort(tx, invoice_not_found(cmd.invoice_id)).await);
        };

        let payment = match invoice.accept_payment(&cmd) {
            Ok(payment) => payment,
            Err(err) => {
                warn!(
                    status = %invoice.status(),
                    remaining = %invoice.remaining_balance(),
                    reason = %err,
                    "payment rejected"
                );
                return Err(abort(tx, err.into()).await);
            }
        };
        Span::current().record("payment_id", tracing::field::display(payment.id));

        tx.insert_payment(&payment).await?;
        tx.save_invoice_state(&invoice).await?;
        tx.commit().await?;

        info!(
            status = %invoice.status(),
            paid = %invoice.paid_amount(),
            total = %invoice.total_amount(),
            "payment accepted"
        );
        Ok(payment)
    }

    /// Cancel an open invoice under the same row lock as payment acceptance.
    #[instrument(skip(self), fields(invoice_id = %id), err)]
    pub async fn cancel_invoice(
        &self,
        id: InvoiceId,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let mut tx = self.store.begin().await?;

        let Some(mut invoice) = tx.lock_invoice(id).await? else {
            return Err(abort(tx, invoice_not_found(id)).await);
        };

        if let Err(err) = invoice.cancel(now) {
            return Err(abort(tx, err.into()).await);
        }

        tx.save_invoice_state(&invoice).await?;
        tx.commit().await?;

        info!("invoice canceled");
        Ok(invoice)
    }

    /// Soft-delete an invoice. Its payments stay on record.
    #[instrument(skip(self), fields(invoice_id = %id), err)]
    pub async fn delete_invoice(
        &self,
        id: InvoiceId,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        if !self.store.soft_delete_invoice(id, now).await? {
            return Err(invoice_not_found(id));
        }
        info!("invoice deleted");
        Ok(())
    }

    pub async fn get_invoice(&self, id: InvoiceId) -> Result<Invoice, BillingError> {
        self.store
            .find_invoice(id)
            .await?
            .ok_or_else(|| invoice_not_found(id))
    }

    pub async fn get_invoice_by_number(&self, number: &str) -> Result<Invoice, BillingError> {
        self.store
            .find_invoice_by_number(number)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("invoice {number} not found")).into())
    }

    pub async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<InvoicePage, BillingError> {
        Ok(self.store.list_invoices(filter).await?)
    }

    /// Payments of an existing invoice, most recent first.
    pub async fn payments_for_invoice(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Vec<Payment>, BillingError> {
        if self.store.find_invoice(invoice_id).await?.is_none() {
            return Err(invoice_not_found(invoice_id));
        }
        Ok(self.store.payments_for_invoice(invoice_id).await?)
    }

    pub async fn get_payment(&self, id: PaymentId) -> Result<Payment, BillingError> {
        self.store
            .find_payment(id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("payment {id} not found")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chalak_billing::{InvoiceStatus, NewInvoiceItem, PaymentMethod};
    use chalak_core::{InstituteId, Money, StudentId, UserId};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use crate::store::{InMemoryBillingStore, InMemoryTx};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 14, 0, 0).unwrap()
    }

    fn issue(total_cents: i64, due_in_days: i64) -> IssueInvoice {
        IssueInvoice {
            invoice_id: InvoiceId::new(),
            student_id: StudentId::new(),
            institute_id: InstituteId::new(),
            due_date: (now() + Duration::days(due_in_days)).date_naive(),
            notes: None,
            items: vec![NewInvoiceItem {
                description: "Category B course".to_string(),
                quantity: 1,
                unit_price: Money::from_cents(total_cents),
            }],
            created_by: UserId::new(),
            occurred_at: now(),
        }
    }

    fn pay(invoice_id: InvoiceId, cents: i64) -> AddPayment {
        AddPayment {
            invoice_id,
            amount: Money::from_cents(cents),
            method: PaymentMethod::Cash,
            payment_date: None,
            notes: Some("front desk".to_string()),
            actor: UserId::new(),
            occurred_at: now(),
        }
    }

    fn service() -> BillingService<InMemoryBillingStore> {
        BillingService::new(InMemoryBillingStore::new())
    }

    #[tokio::test]
    async fn exact_payment_marks_invoice_paid() {
        let svc = service();
        let invoice = svc.issue_invoice(issue(66_000, 30)).await.unwrap();

        let payment = svc.add_payment(pay(invoice.id(), 66_000)).await.unwrap();
        assert_eq!(payment.amount, Money::from_cents(66_000));
        assert_eq!(payment.payment_date, now());

        let stored = svc.get_invoice(invoice.id()).await.unwrap();
        assert_eq!(stored.status(), InvoiceStatus::Paid);
        assert_eq!(stored.paid_at(), Some(now()));
        assert_eq!(
            svc.payments_for_invoice(invoice.id()).await.unwrap(),
            vec![payment.clone()]
        );
        assert_eq!(svc.get_payment(payment.id).await.unwrap(), payment);
    }

    #[tokio::test]
    async fn partial_payment_after_due_date_is_overdue() {
        let svc = service();
        let invoice = svc.issue_invoice(issue(88_000, -1)).await.unwrap();

        svc.add_payment(pay(invoice.id(), 40_000)).await.unwrap();

        let stored = svc.get_invoice(invoice.id()).await.unwrap();
        assert_eq!(stored.status(), InvoiceStatus::Overdue);
        assert_eq!(stored.paid_amount(), Money::from_cents(40_000));
    }

    #[tokio::test]
    async fn paying_a_paid_invoice_conflicts_without_side_effects() {
        let svc = service();
        let invoice = svc.issue_invoice(issue(10_000, 5)).await.unwrap();
        svc.add_payment(pay(invoice.id(), 10_000)).await.unwrap();

        let err = svc.add_payment(pay(invoice.id(), 100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("already fully paid"));

        let stored = svc.get_invoice(invoice.id()).await.unwrap();
        assert_eq!(stored.paid_amount(), Money::from_cents(10_000));
        assert_eq!(svc.payments_for_invoice(invoice.id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overpayment_is_a_bad_request() {
        let svc = service();
        let invoice = svc.issue_invoice(issue(10_000, 5)).await.unwrap();

        let err = svc.add_payment(pay(invoice.id(), 10_001)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(svc.payments_for_invoice(invoice.id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_or_deleted_invoice_is_not_found() {
        let svc = service();
        let err = svc.add_payment(pay(InvoiceId::new(), 100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let invoice = svc.issue_invoice(issue(10_000, 5)).await.unwrap();
        svc.delete_invoice(invoice.id(), now()).await.unwrap();

        let err = svc.add_payment(pay(invoice.id(), 100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            svc.get_invoice(invoice.id()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            svc.payments_for_invoice(invoice.id()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            svc.delete_invoice(invoice.id(), now()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn canceled_invoice_rejects_payments() {
        let svc = service();
        let invoice = svc.issue_invoice(issue(10_000, 5)).await.unwrap();

        let canceled = svc.cancel_invoice(invoice.id(), now()).await.unwrap();
        assert_eq!(canceled.status(), InvoiceStatus::Canceled);

        let err = svc.add_payment(pay(invoice.id(), 100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("cannot pay canceled invoice"));

        let err = svc.cancel_invoice(invoice.id(), now()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn tax_rate_is_applied_on_issue() {
        let svc = service().with_tax_rate(Decimal::new(16, 2));
        let invoice = svc.issue_invoice(issue(50_000, 5)).await.unwrap();

        assert_eq!(invoice.tax_amount(), Money::from_cents(8_000));
        assert_eq!(invoice.total_amount(), Money::from_cents(58_000));

        let by_number = svc
            .get_invoice_by_number(invoice.invoice_number())
            .await
            .unwrap();
        assert_eq!(by_number, invoice);
    }

    #[tokio::test]
    async fn invalid_invoice_is_rejected_before_touching_the_store() {
        let svc = service();
        let mut cmd = issue(10_000, 5);
        cmd.items.clear();

        let err = svc.issue_invoice(cmd).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(
            svc.list_invoices(&InvoiceFilter::default()).await.unwrap().total,
            0
        );
    }

    #[tokio::test]
    async fn oversized_invoice_is_a_bad_request_on_every_backend() {
        let svc = service();
        let cmd = issue(10_000_000_000_000, 5);

        let err = svc.issue_invoice(cmd).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(
            svc.list_invoices(&InvoiceFilter::default()).await.unwrap().total,
            0
        );
    }

    #[tokio::test]
    async fn partial_payment_on_the_due_date_is_overdue() {
        let svc = service();
        let invoice = svc.issue_invoice(issue(88_000, 0)).await.unwrap();

        svc.add_payment(pay(invoice.id(), 40_000)).await.unwrap();

        let stored = svc.get_invoice(invoice.id()).await.unwrap();
        assert_eq!(stored.status(), InvoiceStatus::Overdue);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_full_payments_settle_exactly_once() {
        let svc = Arc::new(service());
        let invoice = svc.issue_invoice(issue(25_000, 5)).await.unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let svc = Arc::clone(&svc);
                let id = invoice.id();
                tokio::spawn(async move { svc.add_payment(pay(id, 25_000)).await })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(err) => assert!(matches!(
                    err.kind(),
                    ErrorKind::Conflict | ErrorKind::BadRequest
                )),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(svc.payments_for_invoice(invoice.id()).await.unwrap().len(), 1);
        let stored = svc.get_invoice(invoice.id()).await.unwrap();
        assert_eq!(stored.paid_amount(), Money::from_cents(25_000));
    }

    /// Store whose transactions fail when persisting invoice state, after the
    /// payment row has already been written.
    #[derive(Debug, Default)]
    struct FailingStore {
        inner: InMemoryBillingStore,
    }

    struct FailingTx(InMemoryTx);

    #[async_trait]
    impl BillingTx for FailingTx {
        async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
            self.0.lock_invoice(id).await
        }

        async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), StoreError> {
            self.0.insert_invoice(invoice).await
        }

        async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
            self.0.insert_payment(payment).await
        }

        async fn save_invoice_state(&mut self, _invoice: &Invoice) -> Result<(), StoreError> {
            Err(StoreError::Database("connection reset".to_string()))
        }

        async fn commit(self) -> Result<(), StoreError> {
            self.0.commit().await
        }

        async fn rollback(self) -> Result<(), StoreError> {
            self.0.rollback().await
        }
    }

    #[async_trait]
    impl BillingStore for FailingStore {
        type Tx = FailingTx;

        async fn begin(&self) -> Result<FailingTx, StoreError> {
            Ok(FailingTx(self.inner.begin().await?))
        }

        async fn find_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
            self.inner.find_invoice(id).await
        }

        async fn find_invoice_by_number(
            &self,
            number: &str,
        ) -> Result<Option<Invoice>, StoreError> {
            self.inner.find_invoice_by_number(number).await
        }

        async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<InvoicePage, StoreError> {
            self.inner.list_invoices(filter).await
        }

        async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
            self.inner.find_payment(id).await
        }

        async fn payments_for_invoice(
            &self,
            invoice_id: InvoiceId,
        ) -> Result<Vec<Payment>, StoreError> {
            self.inner.payments_for_invoice(invoice_id).await
        }

        async fn soft_delete_invoice(
            &self,
            id: InvoiceId,
            at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.soft_delete_invoice(id, at).await
        }
    }

    #[tokio::test]
    async fn failed_invoice_update_leaves_no_payment_behind() {
        let inner = InMemoryBillingStore::new();
        let invoice = BillingService::new(inner.clone())
            .issue_invoice(issue(10_000, 5))
            .await
            .unwrap();

        let svc = BillingService::new(FailingStore {
            inner: inner.clone(),
        });
        let err = svc.add_payment(pay(invoice.id(), 4_000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        assert!(inner.payments_for_invoice(invoice.id()).await.unwrap().is_empty());
        let stored = inner.find_invoice(invoice.id()).await.unwrap().unwrap();
        assert_eq!(stored.paid_amount(), Money::ZERO);
        assert_eq!(stored.status(), InvoiceStatus::Pending);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of payments is attempted, the stored
        /// payments add up to the invoice's paid amount, the paid amount never
        /// exceeds the total and the status follows coverage and lateness.
        #[test]
        fn payment_sequences_keep_stored_balance_consistent(
            total in 1i64..2_000_000i64,
            attempts in prop::collection::vec(-100i64..1_000_000i64, 1..10),
            due_in_days in -10i64..10i64,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let svc = service();
                let invoice = svc.issue_invoice(issue(total, due_in_days)).await.unwrap();

                for cents in attempts {
                    if let Err(err) = svc.add_payment(pay(invoice.id(), cents)).await {
                        prop_assert!(matches!(
                            err.kind(),
                            ErrorKind::BadRequest | ErrorKind::Conflict
                        ));
                    }
                }

                let stored = svc.get_invoice(invoice.id()).await.unwrap();
                let payments = svc.payments_for_invoice(invoice.id()).await.unwrap();
                let recorded = Money::checked_sum(payments.iter().map(|p| p.amount)).unwrap();

                prop_assert_eq!(recorded, stored.paid_amount());
                prop_assert!(stored.paid_amount() <= stored.total_amount());

                let expected = if stored.paid_amount() >= stored.total_amount() {
                    InvoiceStatus::Paid
                } else if stored.paid_amount().is_positive() && due_in_days <= 0 {
                    InvoiceStatus::Overdue
                } else {
                    InvoiceStatus::Pending
                };
                prop_assert_eq!(stored.status(), expected);
                Ok(())
            })?;
        }
    }
}
