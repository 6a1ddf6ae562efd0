use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chalak_core::{DomainError, Entity, InvoiceId, Money, PaymentId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    Online,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Online => "online",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "bank_transfer" => Ok(PaymentMethod::BankTransfer),
            "online" => Ok(PaymentMethod::Online),
            other => Err(DomainError::bad_request(format!(
                "unknown payment method '{other}'"
            ))),
        }
    }
}

/// Command: AddPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPayment {
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    /// When the money changed hands; defaults to `occurred_at`.
    pub payment_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Settlement recorded against one invoice. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    #[serde(rename = "payment_method")]
    pub method: PaymentMethod,
    pub payment_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub(crate) fn record(cmd: &AddPayment) -> Self {
        Self {
            id: PaymentId::new(),
            invoice_id: cmd.invoice_id,
            amount: cmd.amount,
            method: cmd.method,
            payment_date: cmd.payment_date.unwrap_or(cmd.occurred_at),
            notes: cmd.notes.clone().filter(|n| !n.trim().is_empty()),
            created_by: cmd.actor,
            created_at: cmd.occurred_at,
        }
    }
}

impl Entity for Payment {
    type Id = PaymentId;

    fn id(&self) -> PaymentId {
        self.id
    }
}
