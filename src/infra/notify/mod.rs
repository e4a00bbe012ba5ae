//! Notification dispatch adapter backed by the shared PostgreSQL database.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{AppError, DatabaseError, NoticeKind, NotificationSender};

/// Writes notifications into the outbound queue table.
///
/// The `(recipient_id, payment_id, kind)` unique constraint absorbs
/// replayed settlement writes, keeping notification delivery idempotent
/// without any read-before-write.
pub struct PgNotificationSender {
    pool: PgPool,
}

impl PgNotificationSender {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSender for PgNotificationSender {
    #[instrument(skip(self, body), fields(kind = %kind.as_str()))]
    async fn notify(
        &self,
        recipient_id: &str,
        payment_id: &str,
        kind: NoticeKind,
        body: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient_id, payment_id, kind, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (recipient_id, payment_id, kind) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(recipient_id)
        .bind(payment_id)
        .bind(kind.as_str())
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            debug!(recipient_id = %recipient_id, payment_id = %payment_id, "Duplicate notification suppressed");
        }
        Ok(())
    }
}
