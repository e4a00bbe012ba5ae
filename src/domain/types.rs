//! Payment domain types, outcome normalization, and wire DTOs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Daraja result code for a completed, successful push.
pub const MPESA_RESULT_SUCCESS: i32 = 0;
/// Daraja result code for "the balance is insufficient for the transaction".
pub const MPESA_RESULT_INSUFFICIENT_FUNDS: i32 = 1;
/// Daraja result code for "request cancelled by user".
pub const MPESA_RESULT_USER_CANCELLED: i32 = 1032;

/// Free-text phrase that marks a successful payment even when the result code
/// says otherwise. Daraja has been observed delivering asynchronous successes
/// under a non-zero code with this phrase in the description; the phrase wins.
/// Provider-specific and confirmed against sandbox traffic, not guaranteed by
/// Safaricom documentation.
pub const SUCCESS_PHRASE_OVERRIDE: &str = "processed successfully";

/// Lifecycle state of a payment request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Push sent, outcome not yet known
    #[default]
    Pending,
    /// Provider confirmed the payment
    Succeeded,
    /// Provider reported a failure (insufficient funds, errors)
    Failed,
    /// End user dismissed or cancelled the push on their handset
    Cancelled,
    /// No definitive provider answer within the payment window
    Expired,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for PaymentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid payment state: {}", s)),
        }
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized terminal outcome, produced by every finalizer before writing.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOutcome {
    /// Terminal state to write (never `Pending`)
    pub state: PaymentState,
    /// Provider result code, absent for locally-decided expiry
    pub result_code: Option<i32>,
    /// Human-readable outcome detail
    pub result_detail: String,
    /// Provider receipt, retained only for successful outcomes
    pub receipt_ref: Option<String>,
}

impl PaymentOutcome {
    /// Normalizes a provider-reported result into a terminal outcome.
    ///
    /// Code 0 is a success. A description containing
    /// [`SUCCESS_PHRASE_OVERRIDE`] is also a success regardless of code; this
    /// override papers over a known provider inconsistency and is deliberately
    /// explicit here. Code 1032 is a user cancellation. Everything else,
    /// including insufficient funds (code 1), is a failure.
    #[must_use]
    pub fn from_provider(result_code: i32, result_desc: &str, receipt_ref: Option<String>) -> Self {
        let state = if result_code == MPESA_RESULT_SUCCESS {
            PaymentState::Succeeded
        } else if result_desc
            .to_lowercase()
            .contains(SUCCESS_PHRASE_OVERRIDE)
        {
            PaymentState::Succeeded
        } else if result_code == MPESA_RESULT_USER_CANCELLED {
            PaymentState::Cancelled
        } else {
            PaymentState::Failed
        };

        // A receipt on a non-success would violate the ledger invariant.
        let receipt_ref = if state == PaymentState::Succeeded {
            receipt_ref
        } else {
            None
        };

        Self {
            state,
            result_code: Some(result_code),
            result_detail: result_desc.to_string(),
            receipt_ref,
        }
    }

    /// Outcome for a payment whose window elapsed with no provider answer.
    #[must_use]
    pub fn expired() -> Self {
        Self {
            state: PaymentState::Expired,
            result_code: None,
            result_detail: "No provider confirmation within the payment window".to_string(),
            receipt_ref: None,
        }
    }
}

/// Core payment request entity, the ledger's single record type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PaymentRequest {
    /// Unique identifier (UUID)
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: String,
    /// Authenticated party that requested the payment
    #[schema(example = "tenant-8821")]
    pub payer_id: String,
    /// Optional link to the invoice this payment settles
    #[schema(example = "INV-2024-0042")]
    pub invoice_ref: Option<String>,
    /// Payer MSISDN in canonical 254 form
    #[schema(example = "254712345678")]
    pub phone: String,
    /// Amount in whole Kenyan shillings
    #[schema(example = 500)]
    pub amount: i64,
    /// Provider CheckoutRequestID from the initiation ack
    #[schema(example = "ws_CO_191220191020363925")]
    pub provider_checkout_ref: String,
    /// Provider MerchantRequestID from the initiation ack
    #[schema(example = "29115-34620561-1")]
    pub provider_merchant_ref: String,
    /// Lifecycle state
    pub state: PaymentState,
    /// Normalized provider result code, set at finalization
    pub result_code: Option<i32>,
    /// Normalized outcome detail, set at finalization
    pub result_detail: Option<String>,
    /// Provider receipt number, present only on success
    #[schema(example = "NLJ7RT61SV")]
    pub receipt_ref: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Deadline after which the payment expires unanswered
    pub expires_at: DateTime<Utc>,
    /// When a finalizer won the conditional update
    pub finalized_at: Option<DateTime<Utc>>,
    /// Back-reference to the terminal, non-success record this retries
    pub retry_of: Option<String>,
}

impl PaymentRequest {
    /// Builds a fresh `pending` record from a successful initiation ack.
    #[must_use]
    pub fn pending(
        payer_id: String,
        phone: String,
        amount: i64,
        invoice_ref: Option<String>,
        ack: StkPushAck,
        window: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            payer_id,
            invoice_ref,
            phone,
            amount,
            provider_checkout_ref: ack.checkout_ref,
            provider_merchant_ref: ack.merchant_ref,
            state: PaymentState::Pending,
            result_code: None,
            result_detail: None,
            receipt_ref: None,
            created_at: now,
            expires_at: now + window,
            finalized_at: None,
            retry_of: None,
        }
    }

    /// Links this record to the terminal record it retries.
    #[must_use]
    pub fn with_retry_of(mut self, original_id: String) -> Self {
        self.retry_of = Some(original_id);
        self
    }
}

/// Acknowledgment returned by a successful initiate-push call
#[derive(Debug, Clone, PartialEq)]
pub struct StkPushAck {
    /// Provider CheckoutRequestID, the polling/callback correlation key
    pub checkout_ref: String,
    /// Provider MerchantRequestID
    pub merchant_ref: String,
    /// Provider message intended for the end user
    pub customer_message: String,
}

/// Parameters for an outbound initiate-push call
#[derive(Debug, Clone)]
pub struct StkPushRequest {
    /// Payer MSISDN in canonical 254 form
    pub phone: String,
    /// Amount in whole Kenyan shillings
    pub amount: i64,
    /// Account reference shown on the payer's handset
    pub account_reference: String,
    /// Short transaction description
    pub description: String,
    /// Invoice reference round-tripped on the callback URL, if any
    pub invoice_ref: Option<String>,
}

/// Definitive answer from a status query
#[derive(Debug, Clone, PartialEq)]
pub struct StkQueryOutcome {
    /// Provider result code
    pub result_code: i32,
    /// Provider result description
    pub result_desc: String,
}

fn validate_kenyan_phone(phone: &str) -> Result<(), validator::ValidationError> {
    if normalize_msisdn(phone).is_some() {
        Ok(())
    } else {
        Err(validator::ValidationError::new("phone")
            .with_message(std::borrow::Cow::Borrowed(
                "Phone must be a Kenyan mobile number (07…, 01… or 254…)",
            )))
    }
}

/// Canonicalizes a Kenyan MSISDN to the 254XXXXXXXXX form the provider
/// expects. Accepts `07…`/`01…` local forms and `254…`/`+254…` international
/// forms; anything else is rejected.
pub fn normalize_msisdn(phone: &str) -> Option<String> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        12 if digits.starts_with("2547") || digits.starts_with("2541") => {
            Some(digits.to_string())
        }
        10 if digits.starts_with("07") || digits.starts_with("01") => {
            Some(format!("254{}", &digits[1..]))
        }
        _ => None,
    }
}

/// Request to initiate a payment
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    /// Payer phone number, local or international Kenyan form
    #[validate(custom(function = validate_kenyan_phone))]
    #[schema(example = "0712345678")]
    pub phone: String,
    /// Amount in whole Kenyan shillings
    #[validate(range(min = 1, message = "Amount must be at least 1 shilling"))]
    #[schema(example = 500)]
    pub amount: i64,
    /// Invoice to settle on success
    #[validate(length(max = 64, message = "Invoice reference too long"))]
    #[schema(example = "INV-2024-0042")]
    pub invoice_ref: Option<String>,
}

impl InitiatePaymentRequest {
    #[must_use]
    pub fn new(phone: String, amount: i64, invoice_ref: Option<String>) -> Self {
        Self {
            phone,
            amount,
            invoice_ref,
        }
    }
}

/// Response to a successful initiation or retry
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    /// Ledger identifier for the new payment
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub payment_id: String,
    /// Provider checkout reference to poll with
    #[schema(example = "ws_CO_191220191020363925")]
    pub checkout_ref: String,
    /// Deadline after which the payment expires unanswered
    pub expires_at: DateTime<Utc>,
}

impl InitiatePaymentResponse {
    #[must_use]
    pub fn from_record(record: &PaymentRequest) -> Self {
        Self {
            payment_id: record.id.clone(),
            checkout_ref: record.provider_checkout_ref.clone(),
            expires_at: record.expires_at,
        }
    }
}

/// Polling response for a payment's current state
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    /// Current lifecycle state
    pub state: PaymentState,
    /// Normalized outcome detail, absent while pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_detail: Option<String>,
    /// Amount in whole Kenyan shillings
    #[schema(example = 500)]
    pub amount: i64,
    /// Provider receipt, present only on success
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "NLJ7RT61SV")]
    pub receipt_ref: Option<String>,
}

impl PaymentStatusResponse {
    #[must_use]
    pub fn from_record(record: &PaymentRequest) -> Self {
        Self {
            state: record.state,
            result_detail: record.result_detail.clone(),
            amount: record.amount,
            receipt_ref: record.receipt_ref.clone(),
        }
    }
}

/// Listing entry for a caller's payment history
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    /// Ledger identifier
    pub payment_id: String,
    /// Provider checkout reference
    pub checkout_ref: String,
    /// Current lifecycle state
    pub state: PaymentState,
    /// Amount in whole Kenyan shillings
    pub amount: i64,
    /// Invoice this payment settles, if any
    pub invoice_ref: Option<String>,
    /// Record this one retries, if any
    pub retry_of: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Finalization timestamp, absent while pending
    pub finalized_at: Option<DateTime<Utc>>,
}

impl PaymentSummary {
    #[must_use]
    pub fn from_record(record: &PaymentRequest) -> Self {
        Self {
            payment_id: record.id.clone(),
            checkout_ref: record.provider_checkout_ref.clone(),
            state: record.state,
            amount: record.amount,
            invoice_ref: record.invoice_ref.clone(),
            retry_of: record.retry_of.clone(),
            created_at: record.created_at,
            finalized_at: record.finalized_at,
        }
    }
}

/// Acknowledgment body Daraja expects from the callback endpoint.
/// Returned unconditionally; any other shape triggers provider-side retries.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Callback received successfully".to_string(),
        }
    }
}

/// Daraja STK callback envelope: `{"Body": {"stkCallback": {…}}}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

/// The callback payload proper
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub item: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    fn metadata_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.callback_metadata
            .as_ref()?
            .item
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    /// MpesaReceiptNumber from the success metadata, if present.
    pub fn receipt_ref(&self) -> Option<String> {
        self.metadata_value("MpesaReceiptNumber")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Confirmed amount from the success metadata, if present.
    pub fn confirmed_amount(&self) -> Option<i64> {
        self.metadata_value("Amount").and_then(|v| {
            v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
        })
    }
}

/// Notification categories emitted by settlement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCancelled,
    PaymentExpired,
    InvoicePaid,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentCancelled => "payment_cancelled",
            Self::PaymentExpired => "payment_expired",
            Self::InvoicePaid => "invoice_paid",
        }
    }

    /// Notice kind describing a terminal payment outcome to its payer.
    #[must_use]
    pub fn for_outcome(state: PaymentState) -> Option<Self> {
        match state {
            PaymentState::Succeeded => Some(Self::PaymentSucceeded),
            PaymentState::Failed => Some(Self::PaymentFailed),
            PaymentState::Cancelled => Some(Self::PaymentCancelled),
            PaymentState::Expired => Some(Self::PaymentExpired),
            PaymentState::Pending => None,
        }
    }
}

/// Result of an idempotent invoice settlement
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceSettlement {
    /// Party that owns the settled invoice
    pub owner_id: String,
    /// False when the invoice was already paid (repeat settlement no-op)
    pub newly_paid: bool,
}

/// Pagination parameters for list requests
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct PaginationParams {
    /// Maximum number of items to return (1-100, default: 20)
    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    #[serde(default = "default_limit")]
    #[schema(example = 20)]
    pub limit: i64,
    /// Cursor for pagination (ID to start after)
    #[schema(example = "uuid-string")]
    pub cursor: Option<String>,
}

fn default_limit() -> i64 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            cursor: None,
        }
    }
}

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T: ToSchema> {
    /// List of items
    pub items: Vec<T>,
    /// Cursor for next page (null if no more items)
    #[schema(example = "uuid-string")]
    pub next_cursor: Option<String>,
    /// Whether more items exist
    pub has_more: bool,
}

impl<T: ToSchema> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>, has_more: bool) -> Self {
        Self {
            items,
            next_cursor,
            has_more,
        }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    /// Database health status
    pub database: HealthStatus,
    /// Payment provider reachability
    pub provider: HealthStatus,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
    /// Application version
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, provider: HealthStatus) -> Self {
        let status = match (&database, &provider) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            provider,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "validation_error")]
    pub r#type: String,
    /// Human-readable error message
    #[schema(example = "Phone must be a Kenyan mobile number")]
    pub message: String,
}

/// Rate limit exceeded response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Seconds until rate limit resets
    #[schema(example = 60)]
    pub retry_after: u64,
}
