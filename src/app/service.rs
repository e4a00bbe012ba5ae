//! Application service layer implementing the payment finalization protocol.
//!
//! Every path out of `pending` (provider callback, status polling, expiry)
//! funnels through [`PaymentService::finalize`], which delegates the race to
//! the ledger's conditional update and runs settlement only for the winner.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use crate::domain::{
    types::normalize_msisdn, AppError, HealthResponse, HealthStatus, InitiatePaymentRequest,
    InvoiceClient, MpesaGateway, NotificationSender, PaginatedResponse, PaymentOutcome,
    PaymentRequest, PaymentState, PaymentStore, StkCallback, StkPushRequest, ValidationError,
};

use super::settlement::SettlementNotifier;
use super::watcher::ExpiryScheduler;

/// Payment window applied when none is configured
pub const DEFAULT_PAYMENT_WINDOW_SECS: i64 = 120;

/// Shown on the payer's handset as the transaction description
const TRANSACTION_DESC: &str = "Payment";

/// Application service containing the orchestration logic
pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn MpesaGateway>,
    settlement: SettlementNotifier,
    scheduler: ExpiryScheduler,
    payment_window: Duration,
}

impl PaymentService {
    #[must_use]
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn MpesaGateway>,
        invoices: Arc<dyn InvoiceClient>,
        notifications: Arc<dyn NotificationSender>,
        scheduler: ExpiryScheduler,
    ) -> Self {
        Self {
            store,
            gateway,
            settlement: SettlementNotifier::new(invoices, notifications),
            scheduler,
            payment_window: Duration::seconds(DEFAULT_PAYMENT_WINDOW_SECS),
        }
    }

    /// Override the payment window (how long a push may stay unanswered).
    #[must_use]
    pub fn with_payment_window(mut self, window: Duration) -> Self {
        self.payment_window = window;
        self
    }

    /// Initiate a push payment: validate, call the provider, persist the
    /// `pending` record, and schedule its expiry. A provider failure leaves
    /// no ledger record behind; there is nothing to reconcile.
    #[instrument(skip(self, request), fields(payer = %payer_id, amount = %request.amount))]
    pub async fn initiate_payment(
        &self,
        payer_id: &str,
        request: &InitiatePaymentRequest,
    ) -> Result<PaymentRequest, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::from(e)
        })?;

        let phone = normalize_msisdn(&request.phone).ok_or_else(|| {
            AppError::Validation(ValidationError::InvalidField {
                field: "phone".to_string(),
                message: "Phone must be a Kenyan mobile number".to_string(),
            })
        })?;

        self.start_push(
            payer_id,
            phone,
            request.amount,
            request.invoice_ref.clone(),
            None,
        )
        .await
    }

    /// Process a provider callback. Internal failures are propagated so the
    /// handler can log them, but the handler acknowledges the provider
    /// unconditionally either way.
    #[instrument(
        skip(self, callback),
        fields(checkout_ref = %callback.checkout_request_id, result_code = %callback.result_code)
    )]
    pub async fn handle_callback(&self, callback: &StkCallback) -> Result<(), AppError> {
        let Some(record) = self
            .store
            .get_payment_by_checkout_ref(&callback.checkout_request_id)
            .await?
        else {
            warn!("Callback for unknown checkout reference");
            return Ok(());
        };

        if record.state.is_terminal() {
            debug!(id = %record.id, state = %record.state, "Callback after finalization, ignoring");
            return Ok(());
        }

        if let Some(confirmed) = callback.confirmed_amount() {
            if confirmed != record.amount {
                warn!(
                    id = %record.id,
                    expected = record.amount,
                    confirmed = confirmed,
                    "Provider confirmed a different amount than requested"
                );
            }
        }

        let outcome = PaymentOutcome::from_provider(
            callback.result_code,
            &callback.result_desc,
            callback.receipt_ref(),
        );
        self.finalize(&record, outcome).await?;
        Ok(())
    }

    /// Current status of a payment, reconciling with the provider when the
    /// record is still open. Polling callers always receive a payment state:
    /// provider trouble during the query is absorbed as `pending` because the
    /// expiry watcher guarantees eventual resolution.
    #[instrument(skip(self))]
    pub async fn check_status(&self, checkout_ref: &str) -> Result<PaymentRequest, AppError> {
        let record = self
            .store
            .get_payment_by_checkout_ref(checkout_ref)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No payment with checkout reference {}",
                    checkout_ref
                ))
            })?;

        if record.state.is_terminal() {
            return Ok(record);
        }

        if Utc::now() >= record.expires_at {
            return self.finalize_or_reread(&record, PaymentOutcome::expired()).await;
        }

        match self.gateway.query_status(checkout_ref).await {
            Ok(answer) => {
                let outcome =
                    PaymentOutcome::from_provider(answer.result_code, &answer.result_desc, None);
                self.finalize_or_reread(&record, outcome).await
            }
            Err(e @ AppError::Provider(_)) => {
                if e.is_transient_provider() {
                    debug!(id = %record.id, error = %e, "No definitive answer yet, still pending");
                } else {
                    warn!(id = %record.id, error = %e, "Provider query failed, reporting pending");
                }
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a payment whose window has closed: one last provider pass,
    /// then expiry if no definitive answer exists. Called by the one-shot
    /// watcher task and the sweeper; a no-op for already-terminal records.
    #[instrument(skip(self))]
    pub async fn resolve_expiry(&self, payment_id: &str) -> Result<(), AppError> {
        let Some(record) = self.store.get_payment(payment_id).await? else {
            warn!("Expiry fired for unknown payment");
            return Ok(());
        };

        if record.state.is_terminal() {
            return Ok(());
        }

        match self.gateway.query_status(&record.provider_checkout_ref).await {
            Ok(answer) => {
                let outcome =
                    PaymentOutcome::from_provider(answer.result_code, &answer.result_desc, None);
                self.finalize(&record, outcome).await?;
            }
            Err(e) => {
                debug!(id = %record.id, error = %e, "No definitive answer at expiry");
                self.finalize(&record, PaymentOutcome::expired()).await?;
            }
        }
        Ok(())
    }

    /// Retry a terminal, non-successful payment as a brand-new push linked to
    /// the original through `retry_of`. The original record is never mutated.
    #[instrument(skip(self), fields(payer = %payer_id))]
    pub async fn retry_payment(
        &self,
        payer_id: &str,
        payment_id: &str,
    ) -> Result<PaymentRequest, AppError> {
        let original = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No payment {}", payment_id)))?;

        if original.payer_id != payer_id {
            warn!(id = %payment_id, "Retry attempted by a different payer");
            return Err(AppError::NotAuthorized(
                "Payment belongs to a different payer".to_string(),
            ));
        }

        match original.state {
            PaymentState::Pending => Err(AppError::NotRetryable(
                "Payment is still pending; wait for it to finish".to_string(),
            )),
            PaymentState::Succeeded => Err(AppError::NotRetryable(
                "Payment already succeeded".to_string(),
            )),
            _ => {
                info!(original = %original.id, "Retrying payment");
                self.start_push(
                    payer_id,
                    original.phone.clone(),
                    original.amount,
                    original.invoice_ref.clone(),
                    Some(original.id.clone()),
                )
                .await
            }
        }
    }

    /// List a payer's payments with pagination
    #[instrument(skip(self))]
    pub async fn list_payments(
        &self,
        payer_id: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<PaymentRequest>, AppError> {
        self.store.list_payments_for_payer(payer_id, limit, cursor).await
    }

    /// Resolve overdue pending payments in one batch (called by the sweeper)
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, batch_size: i64) -> Result<usize, AppError> {
        let overdue = self.store.get_expired_pending(Utc::now(), batch_size).await?;
        let count = overdue.len();

        if count == 0 {
            return Ok(0);
        }

        info!(count = count, "Resolving overdue pending payments");

        for record in overdue {
            if let Err(e) = self.resolve_expiry(&record.id).await {
                error!(id = %record.id, error = ?e, "Failed to resolve overdue payment");
            }
        }

        Ok(count)
    }

    /// Perform health check on all dependencies
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let db_health = match self.store.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let provider_health = match self.gateway.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(db_health, provider_health)
    }

    /// Shared by initiation and retry: push first, record second.
    async fn start_push(
        &self,
        payer_id: &str,
        phone: String,
        amount: i64,
        invoice_ref: Option<String>,
        retry_of: Option<String>,
    ) -> Result<PaymentRequest, AppError> {
        let push = StkPushRequest {
            phone: phone.clone(),
            amount,
            account_reference: invoice_ref
                .clone()
                .unwrap_or_else(|| payer_id.to_string()),
            description: TRANSACTION_DESC.to_string(),
            invoice_ref: invoice_ref.clone(),
        };

        let ack = self.gateway.initiate_push(&push).await?;

        let mut record = PaymentRequest::pending(
            payer_id.to_string(),
            phone,
            amount,
            invoice_ref,
            ack,
            self.payment_window,
        );
        if let Some(original) = retry_of {
            record = record.with_retry_of(original);
        }

        self.store.create_payment(&record).await?;
        self.scheduler.schedule(record.id.clone(), record.expires_at);

        info!(
            id = %record.id,
            checkout_ref = %record.provider_checkout_ref,
            "Payment initiated, awaiting confirmation"
        );
        Ok(record)
    }

    /// The finalization protocol: one atomic conditional write decides the
    /// winner among racing finalizers, and settlement runs only on the
    /// winning path. A `None` from the store means another source already
    /// finalized the record; settlement must not run again.
    async fn finalize(
        &self,
        record: &PaymentRequest,
        outcome: PaymentOutcome,
    ) -> Result<Option<PaymentRequest>, AppError> {
        match self.store.finalize_if_pending(&record.id, &outcome).await? {
            Some(finalized) => {
                info!(
                    id = %finalized.id,
                    state = %finalized.state,
                    result_code = ?finalized.result_code,
                    "Payment finalized"
                );
                self.settlement.settle(&finalized).await;
                Ok(Some(finalized))
            }
            None => {
                debug!(id = %record.id, "Lost the finalization race, record already terminal");
                Ok(None)
            }
        }
    }

    /// Finalize, falling back to a fresh read when another finalizer won, so
    /// callers always observe the terminal record.
    async fn finalize_or_reread(
        &self,
        record: &PaymentRequest,
        outcome: PaymentOutcome,
    ) -> Result<PaymentRequest, AppError> {
        if let Some(finalized) = self.finalize(record, outcome).await? {
            return Ok(finalized);
        }
        self.store.get_payment(&record.id).await?.ok_or_else(|| {
            AppError::Internal(format!(
                "Payment {} disappeared after a finalization race",
                record.id
            ))
        })
    }
}
