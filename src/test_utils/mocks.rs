//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::{
    AppError, DatabaseError, InvoiceClient, InvoiceSettlement, MpesaGateway, NoticeKind,
    NotificationSender, PaginatedResponse, PaymentOutcome, PaymentRequest, PaymentState,
    PaymentStore, ProviderError, StkPushAck, StkPushRequest, StkQueryOutcome,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// Mock payment ledger for testing
pub struct MockPaymentStore {
    storage: Arc<Mutex<HashMap<String, PaymentRequest>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
}

impl MockPaymentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(HashMap::new())),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Seed a record directly, bypassing the initiation flow (for testing)
    pub fn insert_record(&self, record: PaymentRequest) {
        let mut storage = self.storage.lock().unwrap();
        storage.insert(record.id.clone(), record);
    }

    /// Get all stored records (for testing)
    pub fn get_all_records(&self) -> Vec<PaymentRequest> {
        self.storage.lock().unwrap().values().cloned().collect()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MockPaymentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentStore for MockPaymentStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn create_payment(&self, record: &PaymentRequest) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut storage = self.storage.lock().unwrap();
        storage.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_payment(&self, id: &str) -> Result<Option<PaymentRequest>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        Ok(storage.get(id).cloned())
    }

    async fn get_payment_by_checkout_ref(
        &self,
        checkout_ref: &str,
    ) -> Result<Option<PaymentRequest>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        Ok(storage
            .values()
            .find(|r| r.provider_checkout_ref == checkout_ref)
            .cloned())
    }

    async fn finalize_if_pending(
        &self,
        id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<Option<PaymentRequest>, AppError> {
        self.check_should_fail()?;
        let mut storage = self.storage.lock().unwrap();
        match storage.get_mut(id) {
            // Same winner-takes-all semantics as the SQL compare-and-set:
            // only a pending record can be written, everyone else gets None.
            Some(record) if record.state == PaymentState::Pending => {
                record.state = outcome.state;
                record.result_code = outcome.result_code;
                record.result_detail = Some(outcome.result_detail.clone());
                record.receipt_ref = outcome.receipt_ref.clone();
                record.finalized_at = Some(Utc::now());
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_expired_pending(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRequest>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<PaymentRequest> = storage
            .values()
            .filter(|r| r.state == PaymentState::Pending && r.expires_at <= as_of)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(items.into_iter().take(limit as usize).collect())
    }

    async fn list_payments_for_payer(
        &self,
        payer_id: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<PaymentRequest>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<PaymentRequest> = storage
            .values()
            .filter(|r| r.payer_id == payer_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        // Apply cursor
        let items = if let Some(cursor_id) = cursor {
            let pos = items.iter().position(|i| i.id == cursor_id);
            match pos {
                Some(p) => items.into_iter().skip(p + 1).collect(),
                None => {
                    return Err(AppError::Validation(
                        crate::domain::ValidationError::InvalidField {
                            field: "cursor".to_string(),
                            message: "Invalid cursor".to_string(),
                        },
                    ));
                }
            }
        } else {
            items
        };

        let limit = limit.clamp(1, 100) as usize;
        let has_more = items.len() > limit;
        let items: Vec<PaymentRequest> = items.into_iter().take(limit).collect();
        let next_cursor = if has_more {
            items.last().map(|i| i.id.clone())
        } else {
            None
        };

        Ok(PaginatedResponse::new(items, next_cursor, has_more))
    }
}

/// Scripted answer for mock status queries
#[derive(Debug, Clone)]
pub enum MockQueryBehavior {
    /// Push still open on the provider side (the default)
    StillProcessing,
    /// Provider unreachable
    Unreachable(String),
    /// Definitive outcome
    Answer(StkQueryOutcome),
}

/// Mock M-Pesa gateway for testing
pub struct MockMpesaGateway {
    pushes: Arc<Mutex<Vec<StkPushRequest>>>,
    queries: Arc<Mutex<Vec<String>>>,
    query_behavior: Arc<Mutex<MockQueryBehavior>>,
    reject_message: Option<String>,
    config: MockConfig,
    is_healthy: AtomicBool,
    next_ref: AtomicU64,
}

impl MockMpesaGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            pushes: Arc::new(Mutex::new(Vec::new())),
            queries: Arc::new(Mutex::new(Vec::new())),
            query_behavior: Arc::new(Mutex::new(MockQueryBehavior::StillProcessing)),
            reject_message: None,
            config,
            is_healthy: AtomicBool::new(true),
            next_ref: AtomicU64::new(1),
        }
    }

    /// Gateway whose requests fail as unreachable
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Gateway that synchronously refuses every push
    #[must_use]
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            reject_message: Some(message.into()),
            ..Self::new()
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Script what subsequent status queries answer
    pub fn set_query_behavior(&self, behavior: MockQueryBehavior) {
        *self.query_behavior.lock().unwrap() = behavior;
    }

    /// Pushes initiated so far (for testing)
    pub fn pushed_requests(&self) -> Vec<StkPushRequest> {
        self.pushes.lock().unwrap().clone()
    }

    /// Checkout references queried so far (for testing)
    pub fn queried_refs(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Provider(ProviderError::Unreachable(msg)));
        }
        Ok(())
    }
}

impl Default for MockMpesaGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MpesaGateway for MockMpesaGateway {
    async fn initiate_push(&self, request: &StkPushRequest) -> Result<StkPushAck, AppError> {
        self.check_should_fail()?;
        if let Some(message) = &self.reject_message {
            return Err(AppError::Provider(ProviderError::Rejected(message.clone())));
        }

        let seq = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let mut pushes = self.pushes.lock().unwrap();
        pushes.push(request.clone());

        Ok(StkPushAck {
            checkout_ref: format!("ws_CO_TEST_{seq}"),
            merchant_ref: format!("29115-34620561-{seq}"),
            customer_message: "Success. Request accepted for processing".to_string(),
        })
    }

    async fn query_status(&self, checkout_ref: &str) -> Result<StkQueryOutcome, AppError> {
        self.check_should_fail()?;
        self.queries.lock().unwrap().push(checkout_ref.to_string());

        let behavior = self.query_behavior.lock().unwrap().clone();
        match behavior {
            MockQueryBehavior::StillProcessing => Err(AppError::Provider(
                ProviderError::NoAnswer("The transaction is being processed".to_string()),
            )),
            MockQueryBehavior::Unreachable(message) => {
                Err(AppError::Provider(ProviderError::Unreachable(message)))
            }
            MockQueryBehavior::Answer(outcome) => Ok(outcome),
        }
    }

    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Provider(ProviderError::Unreachable(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }
}

#[derive(Debug, Clone)]
struct MockInvoice {
    owner_id: String,
    amount: i64,
    paid: bool,
}

/// Mock invoice collaborator for testing
pub struct MockInvoiceClient {
    invoices: Arc<Mutex<HashMap<String, MockInvoice>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
    config: MockConfig,
}

impl MockInvoiceClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            invoices: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            config,
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Seed an unpaid invoice (for testing)
    pub fn seed_invoice(&self, invoice_ref: &str, owner_id: &str, amount: i64) {
        let mut invoices = self.invoices.lock().unwrap();
        invoices.insert(
            invoice_ref.to_string(),
            MockInvoice {
                owner_id: owner_id.to_string(),
                amount,
                paid: false,
            },
        );
    }

    pub fn is_paid(&self, invoice_ref: &str) -> bool {
        self.invoices
            .lock()
            .unwrap()
            .get(invoice_ref)
            .map(|i| i.paid)
            .unwrap_or(false)
    }

    /// `(invoice_ref, payment_id)` pairs mark_paid was called with
    pub fn mark_paid_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MockInvoiceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvoiceClient for MockInvoiceClient {
    async fn mark_paid(
        &self,
        invoice_ref: &str,
        payment_id: &str,
        _amount: i64,
    ) -> Result<InvoiceSettlement, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((invoice_ref.to_string(), payment_id.to_string()));
        self.check_should_fail()?;

        let mut invoices = self.invoices.lock().unwrap();
        match invoices.get_mut(invoice_ref) {
            Some(invoice) if !invoice.paid => {
                invoice.paid = true;
                Ok(InvoiceSettlement {
                    owner_id: invoice.owner_id.clone(),
                    newly_paid: true,
                })
            }
            Some(invoice) => Ok(InvoiceSettlement {
                owner_id: invoice.owner_id.clone(),
                newly_paid: false,
            }),
            None => Err(AppError::NotFound(format!(
                "Invoice {invoice_ref} does not exist"
            ))),
        }
    }
}

/// A notification captured by the mock sender
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedNotice {
    pub recipient_id: String,
    pub payment_id: String,
    pub kind: NoticeKind,
    pub body: String,
}

/// Mock notification sender for testing
pub struct MockNotificationSender {
    notices: Arc<Mutex<Vec<RecordedNotice>>>,
    config: MockConfig,
}

impl MockNotificationSender {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            notices: Arc::new(Mutex::new(Vec::new())),
            config,
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// All notices recorded so far (for testing)
    pub fn sent_notices(&self) -> Vec<RecordedNotice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn count_for_kind(&self, kind: NoticeKind) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MockNotificationSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSender for MockNotificationSender {
    async fn notify(
        &self,
        recipient_id: &str,
        payment_id: &str,
        kind: NoticeKind,
        body: &str,
    ) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut notices = self.notices.lock().unwrap();

        // Mirror the unique-key dedup of the real sender
        let duplicate = notices.iter().any(|n| {
            n.recipient_id == recipient_id && n.payment_id == payment_id && n.kind == kind
        });
        if !duplicate {
            notices.push(RecordedNotice {
                recipient_id: recipient_id.to_string(),
                payment_id: payment_id.to_string(),
                kind,
                body: body.to_string(),
            });
        }
        Ok(())
    }
}
