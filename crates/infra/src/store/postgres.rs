//! Postgres-backed billing store.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | `StoreError` |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (check violation) | `23514` | `Constraint` |
//! | Database (numeric value out of range) | `22003` | `Constraint` |
//! | Database (other) / pool / io | any | `Database` |
//! | Row decode failure | n/a | `Corrupt` |
//!
//! ## Locking
//!
//! `lock_invoice` reads with `SELECT ... FOR UPDATE`, so two transactions
//! touching the same invoice serialize on its row until one commits or rolls
//! back. Non-transactional reads never lock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use chalak_billing::{Invoice, InvoiceFilter, InvoiceItem, InvoicePage, InvoiceRecord, Payment};
use chalak_core::{
    Entity, InstituteId, InvoiceId, InvoiceItemId, Money, PaymentId, StudentId, UserId,
};

use super::r#trait::{BillingStore, BillingTx, StoreError};
use crate::config::DatabaseConfig;

macro_rules! invoice_select {
    ($tail:literal) => {
        concat!(
            r#"
            SELECT
                id,
                invoice_number,
                student_id,
                institute_id,
                amount,
                tax_amount,
                total_amount,
                paid_amount,
                status,
                due_date,
                paid_at,
                notes,
                created_by,
                created_at,
                updated_at
            FROM invoices
            "#,
            $tail
        )
    };
}

macro_rules! payment_select {
    ($tail:literal) => {
        concat!(
            r#"
            SELECT
                id,
                invoice_id,
                amount,
                payment_method,
                payment_date,
                notes,
                created_by,
                created_at
            FROM payments
            "#,
            $tail
        )
    };
}

/// Postgres-backed billing store.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBillingStore {
    pool: PgPool,
}

impl PostgresBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a connection pool from configuration and wrap it.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))
    }
}

/// Open transaction on a pooled connection.
///
/// Dropping it without calling `commit` rolls back (sqlx queues the rollback
/// when the connection returns to the pool).
#[derive(Debug)]
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingStore for PostgresBillingStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTx { tx })
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn find_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(invoice_select!("WHERE id = $1 AND deleted_at IS NULL"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("find_invoice", e))?;

        Ok(hydrate(&mut conn, row.into_iter().collect()).await?.pop())
    }

    #[instrument(skip(self), err)]
    async fn find_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>, StoreError> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(invoice_select!(
            "WHERE invoice_number = $1 AND deleted_at IS NULL"
        ))
        .bind(number)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("find_invoice_by_number", e))?;

        Ok(hydrate(&mut conn, row.into_iter().collect()).await?.pop())
    }

    #[instrument(
        skip(self, filter),
        fields(
            limit = filter.limit(),
            offset = filter.offset(),
            returned = tracing::field::Empty
        ),
        err
    )]
    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<InvoicePage, StoreError> {
        let student = filter.student_id.map(Uuid::from);
        let institute = filter.institute_id.map(Uuid::from);
        let status = filter.status.map(|s| s.as_str());

        let mut conn = self.acquire().await?;

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM invoices
            WHERE deleted_at IS NULL
                AND ($1::uuid IS NULL OR student_id = $1)
                AND ($2::uuid IS NULL OR institute_id = $2)
                AND ($3::text IS NULL OR status = $3)
                AND ($4::timestamptz IS NULL OR created_at >= $4)
                AND ($5::timestamptz IS NULL OR created_at <= $5)
            "#,
        )
        .bind(student)
        .bind(institute)
        .bind(status)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("count_invoices", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| StoreError::Corrupt(format!("failed to read count: {e}")))?;

        let rows = sqlx::query(invoice_select!(
            r#"
            WHERE deleted_at IS NULL
                AND ($1::uuid IS NULL OR student_id = $1)
                AND ($2::uuid IS NULL OR institute_id = $2)
                AND ($3::text IS NULL OR status = $3)
                AND ($4::timestamptz IS NULL OR created_at >= $4)
                AND ($5::timestamptz IS NULL OR created_at <= $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#
        ))
        .bind(student)
        .bind(institute)
        .bind(status)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(i64::from(filter.limit()))
        .bind(i64::from(filter.offset()))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("list_invoices", e))?;

        let items = hydrate(&mut conn, rows).await?;
        Span::current().record("returned", items.len());

        Ok(InvoicePage {
            items,
            total: total.max(0) as u64,
        })
    }

    #[instrument(skip(self), fields(payment_id = %id), err)]
    async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(payment_select!("WHERE id = $1 AND deleted_at IS NULL"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_payment", e))?;

        row.map(|r| decode_payment(&r)).transpose()
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn payments_for_invoice(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query(payment_select!(
            r#"
            WHERE invoice_id = $1 AND deleted_at IS NULL
            ORDER BY payment_date DESC, created_at DESC
            "#
        ))
        .bind(invoice_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("payments_for_invoice", e))?;

        rows.iter().map(decode_payment).collect()
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn soft_delete_invoice(
        &self,
        id: InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let deleted = sqlx::query(
            r#"
            UPDATE invoices
            SET deleted_at = $2, updated_at = $2
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_invoice", e))?
        .rows_affected();

        if deleted == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE invoice_items
            SET deleted_at = $2
            WHERE invoice_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_invoice_items", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }
}

#[async_trait]
impl BillingTx for PostgresTx {
    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query(invoice_select!(
            "WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_invoice", e))?;

        Ok(hydrate(&mut self.tx, row.into_iter().collect()).await?.pop())
    }

    #[instrument(
        skip(self, invoice),
        fields(invoice_id = %invoice.id(), invoice_number = invoice.invoice_number()),
        err
    )]
    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), StoreError> {
        let r = invoice.record();

        sqlx::query(
            r#"
            INSERT INTO invoices (
                id,
                invoice_number,
                student_id,
                institute_id,
                amount,
                tax_amount,
                total_amount,
                paid_amount,
                status,
                due_date,
                paid_at,
                notes,
                created_by,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(r.id.as_uuid())
        .bind(&r.invoice_number)
        .bind(r.student_id.as_uuid())
        .bind(r.institute_id.as_uuid())
        .bind(r.amount.as_decimal())
        .bind(r.tax_amount.as_decimal())
        .bind(r.total_amount.as_decimal())
        .bind(r.paid_amount.as_decimal())
        .bind(r.status.as_str())
        .bind(r.due_date)
        .bind(r.paid_at)
        .bind(r.notes.as_deref())
        .bind(r.created_by.as_uuid())
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_invoice", e))?;

        for (position, item) in r.items.iter().enumerate() {
            let position = item_position(r.id, position)?;
            sqlx::query(
                r#"
                INSERT INTO invoice_items (
                    id,
                    invoice_id,
                    position,
                    description,
                    quantity,
                    unit_price,
                    amount,
                    created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(r.id.as_uuid())
            .bind(position)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price.as_decimal())
            .bind(item.amount.as_decimal())
            .bind(r.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_invoice_item", e))?;
        }

        Ok(())
    }

    #[instrument(
        skip(self, payment),
        fields(payment_id = %payment.id, invoice_id = %payment.invoice_id),
        err
    )]
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id,
                invoice_id,
                amount,
                payment_method,
                payment_date,
                notes,
                created_by,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.invoice_id.as_uuid())
        .bind(payment.amount.as_decimal())
        .bind(payment.method.as_str())
        .bind(payment.payment_date)
        .bind(payment.notes.as_deref())
        .bind(payment.created_by.as_uuid())
        .bind(payment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_payment", e))?;

        Ok(())
    }

    #[instrument(
        skip(self, invoice),
        fields(invoice_id = %invoice.id(), status = %invoice.status()),
        err
    )]
    async fn save_invoice_state(&mut self, invoice: &Invoice) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET paid_amount = $2, status = $3, paid_at = $4, updated_at = $5
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(invoice.id().as_uuid())
        .bind(invoice.paid_amount().as_decimal())
        .bind(invoice.status().as_str())
        .bind(invoice.paid_at())
        .bind(invoice.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_invoice_state", e))?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::Constraint(format!(
                "no live invoice {} to update",
                invoice.id()
            )));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Decode invoice rows and attach their line items.
async fn hydrate(conn: &mut PgConnection, rows: Vec<PgRow>) -> Result<Vec<Invoice>, StoreError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let rows = rows
        .iter()
        .map(InvoiceRow::from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Corrupt(format!("failed to deserialize invoice row: {e}")))?;
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

    let item_rows = sqlx::query(
        r#"
        SELECT id, invoice_id, description, quantity, unit_price, amount
        FROM invoice_items
        WHERE invoice_id = ANY($1) AND deleted_at IS NULL
        ORDER BY invoice_id, position
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_invoice_items", e))?;

    let mut items: HashMap<Uuid, Vec<InvoiceItem>> = HashMap::new();
    for row in &item_rows {
        let item = ItemRow::from_row(row)
            .map_err(|e| StoreError::Corrupt(format!("failed to deserialize item row: {e}")))?;
        items
            .entry(item.invoice_id)
            .or_default()
            .push(item.into_item()?);
    }

    rows.into_iter()
        .map(|row| {
            let lines = items.remove(&row.id).unwrap_or_default();
            row.into_invoice(lines)
        })
        .collect()
}

fn decode_payment(row: &PgRow) -> Result<Payment, StoreError> {
    PaymentRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to deserialize payment row: {e}")))?
        .into_payment()
}

fn money(column: &str, value: Decimal) -> Result<Money, StoreError> {
    Money::try_from_decimal(value).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

#[derive(Debug)]
struct InvoiceRow {
    id: Uuid,
    invoice_number: String,
    student_id: Uuid,
    institute_id: Uuid,
    amount: Decimal,
    tax_amount: Decimal,
    total_amount: Decimal,
    paid_amount: Decimal,
    status: String,
    due_date: NaiveDate,
    paid_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for InvoiceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            invoice_number: row.try_get("invoice_number")?,
            student_id: row.try_get("student_id")?,
            institute_id: row.try_get("institute_id")?,
            amount: row.try_get("amount")?,
            tax_amount: row.try_get("tax_amount")?,
            total_amount: row.try_get("total_amount")?,
            paid_amount: row.try_get("paid_amount")?,
            status: row.try_get("status")?,
            due_date: row.try_get("due_date")?,
            paid_at: row.try_get("paid_at")?,
            notes: row.try_get("notes")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl InvoiceRow {
    fn into_invoice(self, items: Vec<InvoiceItem>) -> Result<Invoice, StoreError> {
        let record = InvoiceRecord {
            id: InvoiceId::from_uuid(self.id),
            invoice_number: self.invoice_number,
            student_id: StudentId::from_uuid(self.student_id),
            institute_id: InstituteId::from_uuid(self.institute_id),
            items,
            amount: money("amount", self.amount)?,
            tax_amount: money("tax_amount", self.tax_amount)?,
            total_amount: money("total_amount", self.total_amount)?,
            paid_amount: money("paid_amount", self.paid_amount)?,
            status: self.status.parse()?,
            due_date: self.due_date,
            paid_at: self.paid_at,
            notes: self.notes,
            created_by: UserId::from_uuid(self.created_by),
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        Ok(Invoice::from_record(record)?)
    }
}

#[derive(Debug)]
struct ItemRow {
    id: Uuid,
    invoice_id: Uuid,
    description: String,
    quantity: i32,
    unit_price: Decimal,
    amount: Decimal,
}

impl<'r> FromRow<'r, PgRow> for ItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            invoice_id: row.try_get("invoice_id")?,
            description: row.try_get("description")?,
            quantity: row.try_get("quantity")?,
            unit_price: row.try_get("unit_price")?,
            amount: row.try_get("amount")?,
        })
    }
}

impl ItemRow {
    fn into_item(self) -> Result<InvoiceItem, StoreError> {
        Ok(InvoiceItem {
            id: InvoiceItemId::from_uuid(self.id),
            description: self.description,
            quantity: self.quantity,
            unit_price: money("unit_price", self.unit_price)?,
            amount: money("amount", self.amount)?,
        })
    }
}

#[derive(Debug)]
struct PaymentRow {
    id: Uuid,
    invoice_id: Uuid,
    amount: Decimal,
    payment_method: String,
    payment_date: DateTime<Utc>,
    notes: Option<String>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PaymentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            invoice_id: row.try_get("invoice_id")?,
            amount: row.try_get("amount")?,
            payment_method: row.try_get("payment_method")?,
            payment_date: row.try_get("payment_date")?,
            notes: row.try_get("notes")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl PaymentRow {
    fn into_payment(self) -> Result<Payment, StoreError> {
        Ok(Payment {
            id: PaymentId::from_uuid(self.id),
            invoice_id: InvoiceId::from_uuid(self.invoice_id),
            amount: money("amount", self.amount)?,
            method: self.payment_method.parse()?,
            payment_date: self.payment_date,
            notes: self.notes,
            created_by: UserId::from_uuid(self.created_by),
            created_at: self.created_at,
        })
    }
}

/// Map SQLx errors to `StoreError`.
/// `invoice_items.position` is an `INTEGER`; refuse indexes it cannot hold.
fn item_position(invoice_id: InvoiceId, index: usize) -> Result<i32, StoreError> {
    i32::try_from(index).map_err(|_| {
        StoreError::Constraint(format!(
            "invoice {invoice_id}: item position {index} does not fit the position column"
        ))
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") | Some("22003") => StoreError::Constraint(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Database(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Corrupt(format!("column {index} in {operation}: {source}"))
        }
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}
