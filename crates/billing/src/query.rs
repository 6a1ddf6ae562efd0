use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chalak_core::{InstituteId, StudentId};

use crate::invoice::{Invoice, InvoiceStatus};

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Filter for listing invoices. Every field is optional; results come back
/// newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFilter {
    pub student_id: Option<StudentId>,
    pub institute_id: Option<InstituteId>,
    pub status: Option<InvoiceStatus>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl InvoiceFilter {
    pub fn for_student(student_id: StudentId) -> Self {
        Self {
            student_id: Some(student_id),
            ..Self::default()
        }
    }

    /// Effective page size: missing or zero falls back to the default, large
    /// values are clamped.
    pub fn limit(&self) -> u32 {
        match self.limit {
            None | Some(0) => DEFAULT_PAGE_LIMIT,
            Some(n) => n.min(MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// Whether `invoice` passes every criterion except paging.
    pub fn matches(&self, invoice: &Invoice) -> bool {
        self.student_id.is_none_or(|id| invoice.student_id() == id)
            && self.institute_id.is_none_or(|id| invoice.institute_id() == id)
            && self.status.is_none_or(|s| invoice.status() == s)
            && self.created_from.is_none_or(|from| invoice.created_at() >= from)
            && self.created_to.is_none_or(|to| invoice.created_at() <= to)
    }
}

/// One page of invoices plus the number of matches across all pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoicePage {
    pub items: Vec<Invoice>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(InvoiceFilter::default().limit(), DEFAULT_PAGE_LIMIT);
        let zero = InvoiceFilter {
            limit: Some(0),
            ..InvoiceFilter::default()
        };
        assert_eq!(zero.limit(), DEFAULT_PAGE_LIMIT);
        let huge = InvoiceFilter {
            limit: Some(5_000),
            ..InvoiceFilter::default()
        };
        assert_eq!(huge.limit(), MAX_PAGE_LIMIT);
        assert_eq!(huge.offset(), 0);
    }
}
