use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use chalak_core::{
    DomainError, DomainResult, Entity, InstituteId, InvoiceId, InvoiceItemId, Money, StudentId,
    UserId,
};

use crate::payment::{AddPayment, Payment};
use crate::reconcile::reconcile;

/// Invoice status lifecycle.
///
/// `pending` -> (`overdue`) -> `paid`, with `canceled` reachable from the two
/// open states. `paid` and `canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Canceled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvoiceStatus::Pending),
            "paid" => Ok(InvoiceStatus::Paid),
            "overdue" => Ok(InvoiceStatus::Overdue),
            "canceled" => Ok(InvoiceStatus::Canceled),
            other => Err(DomainError::bad_request(format!(
                "unknown invoice status '{other}' (expected pending, paid, overdue or canceled)"
            ))),
        }
    }
}

/// A billed line: `amount = quantity × unit_price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: InvoiceItemId,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Money,
    pub amount: Money,
}

/// Line item as supplied when issuing an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoiceItem {
    pub description: String,
    pub quantity: i32,
    pub unit_price: Money,
}

impl NewInvoiceItem {
    fn price(&self, line_no: usize) -> DomainResult<InvoiceItem> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(DomainError::bad_request(format!(
                "item {line_no}: description is required"
            )));
        }
        if self.quantity < 1 {
            return Err(DomainError::bad_request(format!(
                "item {line_no}: quantity must be at least 1"
            )));
        }
        if self.unit_price.is_negative() {
            return Err(DomainError::bad_request(format!(
                "item {line_no}: unit price must not be negative"
            )));
        }
        let amount = self
            .unit_price
            .checked_mul_qty(self.quantity)
            .ok_or_else(|| DomainError::bad_request(format!("item {line_no}: amount overflow")))?
            .within_limit(&format!("item {line_no}: amount"))?;

        Ok(InvoiceItem {
            id: InvoiceItemId::new(),
            description: description.to_string(),
            quantity: self.quantity,
            unit_price: self.unit_price,
            amount,
        })
    }
}

/// Command: IssueInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInvoice {
    pub invoice_id: InvoiceId,
    pub student_id: StudentId,
    pub institute_id: InstituteId,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
    pub items: Vec<NewInvoiceItem>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Persisted shape of an invoice.
///
/// Storage adapters read and write this; everything else goes through
/// [`Invoice`], which only hands out records that satisfy the invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: InvoiceId,
    pub invoice_number: String,
    pub student_id: StudentId,
    pub institute_id: InstituteId,
    pub items: Vec<InvoiceItem>,
    pub amount: Money,
    pub tax_amount: Money,
    pub total_amount: Money,
    pub paid_amount: Money,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    pub paid_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Invoice owed by a student.
///
/// Invariants (checked on every construction path):
/// - `paid_amount <= total_amount`
/// - `status == Paid` iff `paid_amount >= total_amount`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Invoice {
    record: InvoiceRecord,
}

impl Entity for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> InvoiceId {
        self.record.id
    }
}

impl Invoice {
    /// Price the items, apply the tax rate and open a `pending` invoice.
    pub fn issue(cmd: &IssueInvoice, tax_rate: Decimal) -> DomainResult<Self> {
        if cmd.items.is_empty() {
            return Err(DomainError::bad_request(
                "invoice must have at least one item",
            ));
        }
        if tax_rate.is_sign_negative() {
            return Err(DomainError::bad_request("tax rate must not be negative"));
        }

        let items = cmd
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| item.price(idx + 1))
            .collect::<DomainResult<Vec<_>>>()?;

        let amount = Money::checked_sum(items.iter().map(|i| i.amount))
            .ok_or_else(|| DomainError::bad_request("invoice amount overflow"))?;
        let tax_amount = amount
            .checked_apply_rate(tax_rate)
            .ok_or_else(|| DomainError::bad_request("invoice tax overflow"))?;
        let total_amount = amount
            .checked_add(tax_amount)
            .ok_or_else(|| DomainError::bad_request("invoice total overflow"))?
            .within_limit("invoice total")?;

        // A zero total would be "paid" the moment it is created.
        if !total_amount.is_positive() {
            return Err(DomainError::bad_request("invoice total must be positive"));
        }

        Ok(Self {
            record: InvoiceRecord {
                id: cmd.invoice_id,
                invoice_number: invoice_number(cmd.invoice_id, cmd.occurred_at),
                student_id: cmd.student_id,
                institute_id: cmd.institute_id,
                items,
                amount,
                tax_amount,
                total_amount,
                paid_amount: Money::ZERO,
                status: InvoiceStatus::Pending,
                due_date: cmd.due_date,
                paid_at: None,
                notes: cmd.notes.clone().filter(|n| !n.trim().is_empty()),
                created_by: cmd.created_by,
                created_at: cmd.occurred_at,
                updated_at: cmd.occurred_at,
            },
        })
    }

    /// Rehydrate from storage, rejecting records that break the invariants.
    pub fn from_record(record: InvoiceRecord) -> DomainResult<Self> {
        if record.paid_amount > record.total_amount {
            return Err(DomainError::invariant(format!(
                "invoice {}: paid amount {} exceeds total {}",
                record.id, record.paid_amount, record.total_amount
            )));
        }
        let covered = record.paid_amount >= record.total_amount;
        if covered != (record.status == InvoiceStatus::Paid) {
            return Err(DomainError::invariant(format!(
                "invoice {}: status '{}' does not match paid {} / total {}",
                record.id, record.status, record.paid_amount, record.total_amount
            )));
        }
        Ok(Self { record })
    }

    pub fn record(&self) -> &InvoiceRecord {
        &self.record
    }

    pub fn into_record(self) -> InvoiceRecord {
        self.record
    }

    pub fn invoice_number(&self) -> &str {
        &self.record.invoice_number
    }

    pub fn student_id(&self) -> StudentId {
        self.record.student_id
    }

    pub fn institute_id(&self) -> InstituteId {
        self.record.institute_id
    }

    pub fn items(&self) -> &[InvoiceItem] {
        &self.record.items
    }

    pub fn amount(&self) -> Money {
        self.record.amount
    }

    pub fn tax_amount(&self) -> Money {
        self.record.tax_amount
    }

    pub fn total_amount(&self) -> Money {
        self.record.total_amount
    }

    pub fn paid_amount(&self) -> Money {
        self.record.paid_amount
    }

    pub fn remaining_balance(&self) -> Money {
        self.record
            .total_amount
            .checked_sub(self.record.paid_amount)
            .unwrap_or(Money::ZERO)
    }

    pub fn status(&self) -> InvoiceStatus {
        self.record.status
    }

    pub fn due_date(&self) -> NaiveDate {
        self.record.due_date
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.record.paid_at
    }

    pub fn notes(&self) -> Option<&str> {
        self.record.notes.as_deref()
    }

    pub fn created_by(&self) -> UserId {
        self.record.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.record.updated_at
    }

    /// Accept a payment against this invoice and reconcile its status.
    ///
    /// On success the invoice has already been updated in place and the
    /// returned `Payment` is the row to persist alongside it.
    pub fn accept_payment(&mut self, cmd: &AddPayment) -> DomainResult<Payment> {
        if cmd.invoice_id != self.record.id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }

        match self.record.status {
            InvoiceStatus::Paid => {
                return Err(DomainError::conflict("invoice is already fully paid"));
            }
            InvoiceStatus::Canceled => {
                return Err(DomainError::conflict("cannot pay canceled invoice"));
            }
            InvoiceStatus::Pending | InvoiceStatus::Overdue => {}
        }

        if !cmd.amount.is_positive() {
            return Err(DomainError::bad_request("payment amount must be positive"));
        }

        let remaining = self.remaining_balance();
        if cmd.amount > remaining {
            return Err(DomainError::bad_request(format!(
                "payment amount {} exceeds remaining balance {}",
                cmd.amount, remaining
            )));
        }

        let paid_amount = self
            .record
            .paid_amount
            .checked_add(cmd.amount)
            .ok_or_else(|| DomainError::invariant("paid amount overflow"))?;

        let status = reconcile(
            self.record.status,
            paid_amount,
            self.record.total_amount,
            self.record.due_date,
            cmd.occurred_at,
        );

        self.record.paid_amount = paid_amount;
        self.record.status = status;
        if status == InvoiceStatus::Paid {
            self.record.paid_at = Some(cmd.occurred_at);
        }
        self.record.updated_at = cmd.occurred_at;

        Ok(Payment::record(cmd))
    }

    /// Cancel an open invoice. Payments already received stay on record.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.record.status {
            InvoiceStatus::Paid => Err(DomainError::conflict("cannot cancel a paid invoice")),
            InvoiceStatus::Canceled => Err(DomainError::conflict("invoice is already canceled")),
            InvoiceStatus::Pending | InvoiceStatus::Overdue => {
                self.record.status = InvoiceStatus::Canceled;
                self.record.updated_at = now;
                Ok(())
            }
        }
    }
}

/// `INV-<year>-<8 hex>`; the suffix comes from the random tail of the
/// (time-ordered) invoice id so invoices issued together do not collide.
fn invoice_number(id: InvoiceId, issued_at: DateTime<Utc>) -> String {
    let hex = id.as_uuid().simple().to_string();
    format!("INV-{}-{}", issued_at.year(), &hex[hex.len() - 8..])
}
