//! Invoice status reconciliation.
//!
//! Given the cumulative paid amount after a payment, decide which status the
//! invoice ends up in. Kept as a free function so the rule can be tested
//! without building whole invoices.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use chalak_core::Money;

use crate::invoice::InvoiceStatus;

/// Compute the status an invoice moves to once `paid_amount` has been updated.
///
/// - fully covered (`paid >= total`) -> `Paid`
/// - partially covered and past the due date -> `Overdue`
/// - partially covered otherwise -> `Pending`
/// - nothing paid -> unchanged
///
/// The due date is read as midnight UTC at its start, so a partial payment
/// made at any time on the due date already counts as late.
pub fn reconcile(
    current: InvoiceStatus,
    paid_amount: Money,
    total_amount: Money,
    due_date: NaiveDate,
    now: DateTime<Utc>,
) -> InvoiceStatus {
    if paid_amount >= total_amount {
        InvoiceStatus::Paid
    } else if paid_amount.is_positive() && is_past_due(due_date, now) {
        InvoiceStatus::Overdue
    } else if paid_amount.is_positive() {
        InvoiceStatus::Pending
    } else {
        current
    }
}

pub(crate) fn is_past_due(due_date: NaiveDate, now: DateTime<Utc>) -> bool {
    now > due_date.and_time(NaiveTime::MIN).and_utc()
}
