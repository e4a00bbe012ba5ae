//! PostgreSQL payment ledger implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

use crate::domain::{
    AppError, DatabaseError, PaginatedResponse, PaymentOutcome, PaymentRequest, PaymentState,
    PaymentStore,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL ledger client with connection pooling
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Parse a database row into a PaymentRequest
    fn row_to_payment_request(row: &sqlx::postgres::PgRow) -> Result<PaymentRequest, AppError> {
        let state_str: String = row.get("state");

        Ok(PaymentRequest {
            id: row.get("id"),
            payer_id: row.get("payer_id"),
            invoice_ref: row.get("invoice_ref"),
            phone: row.get("phone"),
            amount: row.get("amount"),
            provider_checkout_ref: row.get("provider_checkout_ref"),
            provider_merchant_ref: row.get("provider_merchant_ref"),
            state: state_str.parse().unwrap_or(PaymentState::Pending),
            result_code: row.get("result_code"),
            result_detail: row.get("result_detail"),
            receipt_ref: row.get("receipt_ref"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            finalized_at: row.get("finalized_at"),
            retry_of: row.get("retry_of"),
        })
    }
}

#[async_trait]
impl PaymentStore for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(id = %record.id, checkout_ref = %record.provider_checkout_ref))]
    async fn create_payment(&self, record: &PaymentRequest) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO payment_requests (
                id, payer_id, invoice_ref, phone, amount,
                provider_checkout_ref, provider_merchant_ref, state,
                created_at, expires_at, retry_of
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.id)
        .bind(&record.payer_id)
        .bind(&record.invoice_ref)
        .bind(&record.phone)
        .bind(record.amount)
        .bind(&record.provider_checkout_ref)
        .bind(&record.provider_merchant_ref)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(&record.retry_of)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, id: &str) -> Result<Option<PaymentRequest>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, payer_id, invoice_ref, phone, amount,
                   provider_checkout_ref, provider_merchant_ref, state,
                   result_code, result_detail, receipt_ref,
                   created_at, expires_at, finalized_at, retry_of
            FROM payment_requests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_payment_request(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_payment_by_checkout_ref(
        &self,
        checkout_ref: &str,
    ) -> Result<Option<PaymentRequest>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, payer_id, invoice_ref, phone, amount,
                   provider_checkout_ref, provider_merchant_ref, state,
                   result_code, result_detail, receipt_ref,
                   created_at, expires_at, finalized_at, retry_of
            FROM payment_requests
            WHERE provider_checkout_ref = $1
            "#,
        )
        .bind(checkout_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_payment_request(&row)?)),
            None => Ok(None),
        }
    }

    /// The single-statement compare-and-set all finalizers race on. The
    /// `state = 'pending'` guard makes the first writer win; everyone else
    /// matches zero rows and gets `None` back.
    #[instrument(skip(self, outcome), fields(state = %outcome.state))]
    async fn finalize_if_pending(
        &self,
        id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<Option<PaymentRequest>, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE payment_requests
            SET state = $1,
                result_code = $2,
                result_detail = $3,
                receipt_ref = $4,
                finalized_at = NOW()
            WHERE id = $5 AND state = 'pending'
            RETURNING id, payer_id, invoice_ref, phone, amount,
                      provider_checkout_ref, provider_merchant_ref, state,
                      result_code, result_detail, receipt_ref,
                      created_at, expires_at, finalized_at, retry_of
            "#,
        )
        .bind(outcome.state.as_str())
        .bind(outcome.result_code)
        .bind(&outcome.result_detail)
        .bind(&outcome.receipt_ref)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_payment_request(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_expired_pending(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, payer_id, invoice_ref, phone, amount,
                   provider_checkout_ref, provider_merchant_ref, state,
                   result_code, result_detail, receipt_ref,
                   created_at, expires_at, finalized_at, retry_of
            FROM payment_requests
            WHERE state = 'pending' AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(as_of)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_payment_request).collect()
    }

    #[instrument(skip(self))]
    async fn list_payments_for_payer(
        &self,
        payer_id: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<PaymentRequest>, AppError> {
        // Clamp limit to valid range
        let limit = limit.clamp(1, 100);
        // Fetch one extra to determine if there are more items
        let fetch_limit = limit + 1;

        let rows = match cursor {
            Some(cursor_id) => {
                // Get the created_at of the cursor item for proper pagination
                let cursor_row =
                    sqlx::query("SELECT created_at FROM payment_requests WHERE id = $1")
                        .bind(cursor_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

                let cursor_created_at: DateTime<Utc> = match cursor_row {
                    Some(row) => row.get("created_at"),
                    None => {
                        return Err(AppError::Validation(
                            crate::domain::ValidationError::InvalidField {
                                field: "cursor".to_string(),
                                message: "Invalid cursor".to_string(),
                            },
                        ));
                    }
                };

                sqlx::query(
                    r#"
                    SELECT id, payer_id, invoice_ref, phone, amount,
                           provider_checkout_ref, provider_merchant_ref, state,
                           result_code, result_detail, receipt_ref,
                           created_at, expires_at, finalized_at, retry_of
                    FROM payment_requests
                    WHERE payer_id = $1 AND (created_at, id) < ($2, $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(payer_id)
                .bind(cursor_created_at)
                .bind(cursor_id)
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?
            }
            None => sqlx::query(
                r#"
                    SELECT id, payer_id, invoice_ref, phone, amount,
                           provider_checkout_ref, provider_merchant_ref, state,
                           result_code, result_detail, receipt_ref,
                           created_at, expires_at, finalized_at, retry_of
                    FROM payment_requests
                    WHERE payer_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
            )
            .bind(payer_id)
            .bind(fetch_limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?,
        };

        let has_more = rows.len() > limit as usize;
        let payments: Vec<PaymentRequest> = rows
            .iter()
            .take(limit as usize)
            .map(Self::row_to_payment_request)
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = if has_more {
            payments.last().map(|record| record.id.clone())
        } else {
            None
        };

        Ok(PaginatedResponse::new(payments, next_cursor, has_more))
    }
}
