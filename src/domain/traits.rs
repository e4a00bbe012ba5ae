//! Domain traits defining contracts for external systems.

use async_trait::async_trait;

use super::error::AppError;
use super::types::{
    InvoiceSettlement, NoticeKind, PaginatedResponse, PaymentOutcome, PaymentRequest, StkPushAck,
    StkPushRequest, StkQueryOutcome,
};
use chrono::{DateTime, Utc};

/// Mobile-money gateway trait for push initiation and status queries
#[async_trait]
pub trait MpesaGateway: Send + Sync {
    /// Start an STK push on the payer's handset
    async fn initiate_push(&self, request: &StkPushRequest) -> Result<StkPushAck, AppError>;

    /// Ask the provider for the outcome of an outstanding push.
    /// Returns `ProviderError::NoAnswer` while the push is still open.
    async fn query_status(&self, checkout_ref: &str) -> Result<StkQueryOutcome, AppError>;

    /// Check provider reachability
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Ledger trait for payment persistence.
///
/// The ledger is append-only: records are inserted once as `pending` and
/// mutated exactly once by [`PaymentStore::finalize_if_pending`]. Nothing is
/// ever deleted.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new pending payment record
    async fn create_payment(&self, record: &PaymentRequest) -> Result<(), AppError>;

    /// Get a single payment by ID
    async fn get_payment(&self, id: &str) -> Result<Option<PaymentRequest>, AppError>;

    /// Get a single payment by its provider checkout reference
    async fn get_payment_by_checkout_ref(
        &self,
        checkout_ref: &str,
    ) -> Result<Option<PaymentRequest>, AppError>;

    /// Atomically write a terminal outcome, but only if the record is still
    /// `pending`. Returns the finalized record on success and `None` when
    /// another finalizer already won; the caller must not run settlement in
    /// the `None` case.
    async fn finalize_if_pending(
        &self,
        id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<Option<PaymentRequest>, AppError>;

    /// Pending payments whose deadline has passed, oldest first
    async fn get_expired_pending(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, AppError>;

    /// List a payer's payments with cursor-based pagination
    async fn list_payments_for_payer(
        &self,
        payer_id: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<PaymentRequest>, AppError>;
}

/// Invoice collaborator trait for settlement
#[async_trait]
pub trait InvoiceClient: Send + Sync {
    /// Mark an invoice paid by the given payment. Idempotent: a repeat call
    /// on an already-paid invoice reports `newly_paid = false` and changes
    /// nothing.
    async fn mark_paid(
        &self,
        invoice_ref: &str,
        payment_id: &str,
        amount: i64,
    ) -> Result<InvoiceSettlement, AppError>;
}

/// Notification dispatch collaborator trait
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Record a notification for a recipient. Duplicate
    /// (recipient, payment, kind) notifications are no-ops.
    async fn notify(
        &self,
        recipient_id: &str,
        payment_id: &str,
        kind: NoticeKind,
        body: &str,
    ) -> Result<(), AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal implementation for testing default methods
    struct MinimalGateway;

    #[async_trait]
    impl MpesaGateway for MinimalGateway {
        async fn initiate_push(&self, _request: &StkPushRequest) -> Result<StkPushAck, AppError> {
            Ok(StkPushAck {
                checkout_ref: "ws_CO_1".to_string(),
                merchant_ref: "m-1".to_string(),
                customer_message: "ok".to_string(),
            })
        }

        async fn query_status(&self, _checkout_ref: &str) -> Result<StkQueryOutcome, AppError> {
            Ok(StkQueryOutcome {
                result_code: 0,
                result_desc: "The service request is processed successfully.".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_gateway_health_check_defaults_to_ok() {
        let gateway = MinimalGateway;
        assert!(gateway.health_check().await.is_ok());
    }
}
