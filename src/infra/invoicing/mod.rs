//! Invoice settlement adapter backed by the shared PostgreSQL database.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, warn};

use crate::domain::{AppError, DatabaseError, InvoiceClient, InvoiceSettlement};

/// Marks invoices paid in the billing tables.
///
/// The update is a compare-and-set on `status = 'unpaid'`, so replaying a
/// settlement for an already-paid invoice changes nothing and reports
/// `newly_paid = false`.
pub struct PgInvoiceClient {
    pool: PgPool,
}

impl PgInvoiceClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceClient for PgInvoiceClient {
    #[instrument(skip(self))]
    async fn mark_paid(
        &self,
        invoice_ref: &str,
        payment_id: &str,
        amount: i64,
    ) -> Result<InvoiceSettlement, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'paid', paid_by_payment = $2, paid_at = NOW()
            WHERE invoice_ref = $1 AND status = 'unpaid'
            RETURNING owner_id, amount
            "#,
        )
        .bind(invoice_ref)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if let Some(row) = row {
            let owner_id: String = row.get("owner_id");
            let invoice_amount: i64 = row.get("amount");
            if invoice_amount != amount {
                warn!(
                    invoice_ref = %invoice_ref,
                    invoice_amount = invoice_amount,
                    paid_amount = amount,
                    "Invoice settled with a different amount than invoiced"
                );
            }
            debug!(invoice_ref = %invoice_ref, owner_id = %owner_id, "Invoice marked paid");
            return Ok(InvoiceSettlement {
                owner_id,
                newly_paid: true,
            });
        }

        // Zero rows: either the invoice is unknown or someone settled it
        // first. Re-read to tell the two apart.
        let existing = sqlx::query("SELECT owner_id, status FROM invoices WHERE invoice_ref = $1")
            .bind(invoice_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match existing {
            Some(row) => {
                debug!(invoice_ref = %invoice_ref, "Invoice was already paid");
                Ok(InvoiceSettlement {
                    owner_id: row.get("owner_id"),
                    newly_paid: false,
                })
            }
            None => Err(AppError::NotFound(format!(
                "Invoice {invoice_ref} does not exist"
            ))),
        }
    }
}
